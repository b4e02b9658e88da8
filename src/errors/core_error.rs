use pipeflow_core::OrchestrationError;
use pipeflow_domain::DomainError;
use pipeflow_persistence::PersistenceError;
use thiserror::Error;

/// Error de nivel aplicación: agrupa los errores de cada crate del workspace.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Error de orquestación: {0}")]
    Orchestration(#[from] OrchestrationError),
    #[error("Error de persistencia: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("Error de dominio: {0}")]
    Domain(#[from] DomainError),
    #[error("Error en IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("Error de configuración: {0}")]
    Config(String),
}

impl CoreError {
    /// `true` cuando reintentar la operación puede tener éxito.
    pub fn is_transient(&self) -> bool {
        match self {
            CoreError::Orchestration(e) => {
                matches!(pipeflow_core::classify_error(e), pipeflow_core::ErrorClass::Transient)
            }
            CoreError::Persistence(PersistenceError::TransientIo(_))
            | CoreError::Persistence(PersistenceError::SerializationConflict) => true,
            _ => false,
        }
    }
}
