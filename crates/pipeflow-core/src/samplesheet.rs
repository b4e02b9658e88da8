//! Construcción del samplesheet de entrada de un run.
//!
//! Rol en el flujo:
//! - Recorre los join records en orden de `position`.
//! - Cada valor que sea una referencia global a un attachment se copia al
//!   run directory (`input/{tipo}_{id}/{archivo}`) y se reemplaza por la URI
//!   del backend.
//! - Las columnas salen en el orden exacto del header del pipeline; valores
//!   ausentes quedan vacíos y columnas fuera del header se ignoran.
//!
//! Dos columnas pareadas que apuntan al mismo attachment se copian por
//! separado: la clave de destino es la misma y la segunda copia pisa a la
//! primera con idéntico contenido.
use pipeflow_domain::SamplesWorkflowExecution;

use crate::errors::OrchestrationError;
use crate::global_id::GlobalId;
use crate::ports::{BlobStore, ExecutionRepository};
use crate::storage::input_key;

/// Resultado del builder: CSV serializado + join records con URIs.
#[derive(Debug, Clone)]
pub struct StagedSamplesheet {
    pub csv: Vec<u8>,
    pub rows: Vec<SamplesWorkflowExecution>,
    /// Cantidad de copias de attachments realizadas.
    pub staged_inputs: usize,
}

pub struct SamplesheetBuilder<'a> {
    repository: &'a dyn ExecutionRepository,
    blobs: &'a dyn BlobStore,
}

impl<'a> SamplesheetBuilder<'a> {
    pub fn new(repository: &'a dyn ExecutionRepository, blobs: &'a dyn BlobStore) -> Self {
        Self { repository, blobs }
    }

    pub fn build(&self,
                 run_dir: &str,
                 headers: &[String],
                 joins: &[SamplesWorkflowExecution])
                 -> Result<StagedSamplesheet, OrchestrationError> {
        if headers.is_empty() {
            return Err(OrchestrationError::Validation("pipeline declares no samplesheet headers".into()));
        }
        let mut writer = csv::WriterBuilder::new().from_writer(Vec::new());
        writer.write_record(headers).map_err(csv_error)?;

        let mut rows = Vec::with_capacity(joins.len());
        let mut staged_inputs = 0usize;
        for join in joins {
            let mut row = join.clone();
            for value in row.samplesheet_params.values_mut() {
                if let Some(uri) = self.stage_reference(run_dir, value)? {
                    *value = uri;
                    staged_inputs += 1;
                }
            }
            let record: Vec<&str> = headers.iter()
                                           .map(|h| row.samplesheet_params.get(h).map(String::as_str).unwrap_or(""))
                                           .collect();
            writer.write_record(&record).map_err(csv_error)?;
            rows.push(row);
        }

        let csv = writer.into_inner()
                        .map_err(|e| OrchestrationError::Staging(format!("samplesheet flush failed: {e}")))?;
        log::debug!("samplesheet built run_dir={run_dir} rows={} staged_inputs={staged_inputs}", rows.len());
        Ok(StagedSamplesheet { csv, rows, staged_inputs })
    }

    /// Copia el attachment referido por `value` y devuelve su URI; `None` si
    /// el valor no es una referencia.
    fn stage_reference(&self, run_dir: &str, value: &str) -> Result<Option<String>, OrchestrationError> {
        let Some(attachment_id) = GlobalId::attachment_id(value) else {
            return Ok(None);
        };
        let attachment = self.repository
                             .get_attachment(attachment_id)?
                             .ok_or_else(|| OrchestrationError::Validation(format!("attachment {attachment_id} not found")))?;
        let key = input_key(run_dir,
                            attachment.attachable.kind.as_str(),
                            &attachment.attachable.id.to_string(),
                            attachment.filename());
        self.blobs.copy_with_key(&attachment.blob.key, &key)?;
        Ok(Some(self.blobs.resolve_uri(&key)))
    }
}

fn csv_error(e: csv::Error) -> OrchestrationError {
    OrchestrationError::Staging(format!("samplesheet write failed: {e}"))
}
