//! Join record `SamplesWorkflowExecution` y la entidad externa `Sample`.
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Participación de una muestra en una ejecución.
///
/// `position` fija el orden de creación; los steps continuables iteran en ese
/// orden para que el cursor persistido sea estable entre reintentos.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplesWorkflowExecution {
    pub id: Uuid,
    pub workflow_execution_id: Uuid,
    pub sample_id: Uuid,
    /// Identificador público de la muestra; es la clave del manifest.
    pub sample_puid: String,
    pub position: usize,
    pub samplesheet_params: IndexMap<String, String>,
    #[serde(default)]
    pub metadata: IndexMap<String, Value>,
    #[serde(default)]
    pub outputs: Vec<Uuid>,
}

impl SamplesWorkflowExecution {
    pub fn new(workflow_execution_id: Uuid,
               sample_id: Uuid,
               sample_puid: impl Into<String>,
               position: usize,
               samplesheet_params: IndexMap<String, String>)
               -> Self {
        Self { id: Uuid::new_v4(),
               workflow_execution_id,
               sample_id,
               sample_puid: sample_puid.into(),
               position,
               samplesheet_params,
               metadata: IndexMap::new(),
               outputs: Vec::new() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvenanceSource {
    User,
    Analysis,
}

/// Origen de un valor de metadata de la muestra.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataProvenance {
    pub source: ProvenanceSource,
    /// Id de la ejecución cuando `source == Analysis`.
    pub id: Option<Uuid>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub id: Uuid,
    pub puid: String,
    pub name: String,
    #[serde(default)]
    pub metadata: IndexMap<String, Value>,
    #[serde(default)]
    pub metadata_provenance: IndexMap<String, MetadataProvenance>,
}

/// Resultado de fusionar metadata de un análisis sobre una muestra.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MetadataMergeReport {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    /// Claves protegidas por provenance `User`.
    pub unchanged: Vec<String>,
}

impl Sample {
    pub fn new(puid: impl Into<String>, name: impl Into<String>) -> Self {
        Self { id: Uuid::new_v4(),
               puid: puid.into(),
               name: name.into(),
               metadata: IndexMap::new(),
               metadata_provenance: IndexMap::new() }
    }

    /// Fusiona metadata producida por la ejecución `execution_id`. Un valor
    /// cargado por un usuario nunca se pisa desde un análisis.
    pub fn merge_analysis_metadata(&mut self,
                                   entries: &IndexMap<String, Value>,
                                   execution_id: Uuid,
                                   at: DateTime<Utc>)
                                   -> MetadataMergeReport {
        let mut report = MetadataMergeReport::default();
        for (key, value) in entries {
            let user_owned = self.metadata_provenance
                                 .get(key)
                                 .map(|p| p.source == ProvenanceSource::User)
                                 .unwrap_or(false);
            if user_owned {
                report.unchanged.push(key.clone());
                continue;
            }
            match self.metadata.insert(key.clone(), value.clone()) {
                Some(_) => report.updated.push(key.clone()),
                None => report.added.push(key.clone()),
            }
            self.metadata_provenance.insert(key.clone(),
                                            MetadataProvenance { source: ProvenanceSource::Analysis,
                                                                 id: Some(execution_id),
                                                                 updated_at: at });
        }
        report
    }
}
