//! Render de URIs según el backend del Blob Store y helpers de claves del run
//! directory.
//!
//! El servicio remoto lee los inputs directamente desde el almacenamiento, por
//! eso el samplesheet y `input`/`outdir` llevan la URI del backend y no la
//! clave interna del blob.
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "service", rename_all = "snake_case")]
pub enum StorageBackend {
    Local { root: PathBuf },
    S3 { bucket: String },
    Azure { container: String },
    Gcs { bucket: String },
}

impl StorageBackend {
    pub fn render_uri(&self, key: &str) -> String {
        let key = key.trim_start_matches('/');
        match self {
            Self::Local { root } => root.join(key).to_string_lossy().into_owned(),
            Self::S3 { bucket } => format!("s3://{bucket}/{key}"),
            Self::Azure { container } => format!("az://{container}/{key}"),
            Self::Gcs { bucket } => format!("gcs://{bucket}/{key}"),
        }
    }
}

impl Default for StorageBackend {
    fn default() -> Self {
        Self::Local { root: PathBuf::from("storage") }
    }
}

pub const SAMPLESHEET_FILENAME: &str = "samplesheet.csv";

/// Run directory de una ejecución. Depende sólo del id, así que una
/// Preparation re-entregada escribe sobre el mismo prefijo que Cleanup purga.
pub fn run_dir(runs_prefix: &str, execution_id: &Uuid) -> String {
    format!("{}/{execution_id}", runs_prefix.trim_end_matches('/'))
}

pub fn samplesheet_key(run_dir: &str) -> String {
    format!("{run_dir}/{SAMPLESHEET_FILENAME}")
}

pub fn output_prefix(run_dir: &str) -> String {
    format!("{run_dir}/output/")
}

/// Clave determinista del input copiado para un attachment.
pub fn input_key(run_dir: &str, attachable_type: &str, attachable_id: &str, filename: &str) -> String {
    format!("{run_dir}/input/{attachable_type}_{attachable_id}/{filename}")
}

/// Clave de un archivo de salida referido por el manifest. Las rutas se
/// interpretan relativas a `{run_dir}/output/`.
pub fn output_key(run_dir: &str, manifest_path: &str) -> String {
    let rel = manifest_path.trim_start_matches('/');
    let rel = rel.strip_prefix("output/").unwrap_or(rel);
    format!("{}{rel}", output_prefix(run_dir))
}

/// Clave permanente (fuera del run directory) para un output cosechado.
pub fn attachment_key(attachment_id: &str, filename: &str) -> String {
    format!("attachments/{attachment_id}/{filename}")
}

/// sha256 hex del contenido.
pub fn checksum(bytes: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(bytes);
    format!("{:x}", h.finalize())
}

/// Clave content-addressed para `put` sin clave explícita.
pub fn content_key(bytes: &[u8]) -> String {
    format!("blobs/{}", checksum(bytes))
}

/// Último segmento de una ruta.
pub fn filename_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
