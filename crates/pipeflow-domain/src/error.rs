use thiserror::Error;

/// Error del dominio de ejecuciones.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("Error de validación: {0}")]
    ValidationError(String),

    #[error("Error de serialización: {0}")]
    SerializationError(String),
}

impl From<serde_json::Error> for DomainError {
    fn from(e: serde_json::Error) -> Self {
        DomainError::SerializationError(e.to_string())
    }
}
