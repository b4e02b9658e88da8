//! Configuración del motor desde variables de entorno (`PIPEFLOW_*`).
//! El `.env` se carga una sola vez; toda variable ausente o inválida cae a su
//! default.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use dotenvy::dotenv;
use once_cell::sync::Lazy;

use crate::storage::StorageBackend;

static DOTENV_LOADED: Lazy<()> = Lazy::new(|| {
    let _ = dotenv(); // ignora error si no existe .env
});

/// Forzar carga temprana de .env desde aplicaciones externas si se desea.
pub fn init_dotenv() {
    Lazy::force(&DOTENV_LOADED);
}

pub const DEFAULT_MANIFEST_FILENAME: &str = "iridanext.output.json.gz";

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Espera entre la creación y la Preparation.
    pub preparation_delay: Duration,
    /// Espera entre Preparation y Submission.
    pub submission_delay: Duration,
    /// Intervalo de poll cuando el pipeline no define uno.
    pub default_status_check_interval: Duration,
    /// Reintentos acotados ante errores de API del servicio remoto.
    pub api_max_retries: u32,
    pub api_backoff_base: Duration,
    pub api_backoff_max: Duration,
    /// Reintentos acotados ante fallas de staging/repositorio.
    pub staging_max_retries: u32,
    pub connectivity_backoff_base: Duration,
    pub connectivity_backoff_max: Duration,
    pub manifest_filename: String,
    /// Prefijo bajo el cual se crean los run directories.
    pub runs_prefix: String,
    pub storage: StorageBackend,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { preparation_delay: Duration::from_secs(30),
               submission_delay: Duration::ZERO,
               default_status_check_interval: Duration::from_secs(30),
               api_max_retries: 3,
               api_backoff_base: Duration::from_secs(10),
               api_backoff_max: Duration::from_secs(600),
               staging_max_retries: 3,
               connectivity_backoff_base: Duration::from_secs(5),
               connectivity_backoff_max: Duration::from_secs(900),
               manifest_filename: DEFAULT_MANIFEST_FILENAME.to_string(),
               runs_prefix: "runs".to_string(),
               storage: StorageBackend::default() }
    }
}

fn secs(name: &str, default: Duration) -> Duration {
    env::var(name).ok()
                  .and_then(|v| v.trim().parse::<u64>().ok())
                  .map(Duration::from_secs)
                  .unwrap_or(default)
}

fn count(name: &str, default: u32) -> u32 {
    env::var(name).ok().and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn storage_from_env() -> StorageBackend {
    let service = env::var("PIPEFLOW_STORAGE").unwrap_or_else(|_| "local".into());
    match service.trim().to_ascii_lowercase().as_str() {
        "s3" | "amazon" => StorageBackend::S3 { bucket: env::var("PIPEFLOW_STORAGE_BUCKET").unwrap_or_default() },
        "azure" | "az" => StorageBackend::Azure { container: env::var("PIPEFLOW_STORAGE_CONTAINER").unwrap_or_default() },
        "gcs" | "google" => StorageBackend::Gcs { bucket: env::var("PIPEFLOW_STORAGE_BUCKET").unwrap_or_default() },
        _ => StorageBackend::Local { root: env::var("PIPEFLOW_STORAGE_ROOT").map(PathBuf::from)
                                                                          .unwrap_or_else(|_| PathBuf::from("storage")) },
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        init_dotenv();
        let d = Self::default();
        Self { preparation_delay: secs("PIPEFLOW_PREPARATION_DELAY_SECS", d.preparation_delay),
               submission_delay: secs("PIPEFLOW_SUBMISSION_DELAY_SECS", d.submission_delay),
               default_status_check_interval: secs("PIPEFLOW_STATUS_CHECK_INTERVAL_SECS",
                                                   d.default_status_check_interval),
               api_max_retries: count("PIPEFLOW_API_MAX_RETRIES", d.api_max_retries),
               api_backoff_base: secs("PIPEFLOW_API_BACKOFF_BASE_SECS", d.api_backoff_base),
               api_backoff_max: secs("PIPEFLOW_API_BACKOFF_MAX_SECS", d.api_backoff_max),
               staging_max_retries: count("PIPEFLOW_STAGING_MAX_RETRIES", d.staging_max_retries),
               connectivity_backoff_base: secs("PIPEFLOW_CONNECTIVITY_BACKOFF_BASE_SECS", d.connectivity_backoff_base),
               connectivity_backoff_max: secs("PIPEFLOW_CONNECTIVITY_BACKOFF_MAX_SECS", d.connectivity_backoff_max),
               manifest_filename: env::var("PIPEFLOW_MANIFEST_FILENAME").unwrap_or(d.manifest_filename),
               runs_prefix: env::var("PIPEFLOW_RUNS_PREFIX").unwrap_or(d.runs_prefix),
               storage: storage_from_env() }
    }

    /// Config sin esperas, útil para tests y simulaciones.
    pub fn immediate() -> Self {
        Self { preparation_delay: Duration::ZERO,
               submission_delay: Duration::ZERO,
               default_status_check_interval: Duration::from_secs(30),
               api_backoff_base: Duration::from_secs(1),
               api_backoff_max: Duration::from_secs(8),
               connectivity_backoff_base: Duration::from_secs(1),
               connectivity_backoff_max: Duration::from_secs(60),
               ..Self::default() }
    }
}
