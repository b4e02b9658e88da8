//! Errores de persistencia.
//! Mapea errores de Diesel / conexión a variantes semánticas y luego a los
//! errores del orquestador.

use diesel::result::{DatabaseErrorKind, Error as DieselError};
use pipeflow_core::OrchestrationError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("unique violation: {0}")]
    UniqueViolation(String),
    #[error("check violation: {0}")]
    CheckViolation(String),
    #[error("foreign key violation: {0}")]
    ForeignKeyViolation(String),
    #[error("not found")]
    NotFound,
    #[error("serialization conflict (retryable)")]
    SerializationConflict,
    #[error("transient IO / connection pool error: {0}")]
    TransientIo(String),
    #[error("corrupt document: {0}")]
    Document(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("unknown database error: {0}")]
    Unknown(String),
}

impl From<DieselError> for PersistenceError {
    fn from(err: DieselError) -> Self {
        match err {
            DieselError::NotFound => Self::NotFound,
            DieselError::DatabaseError(kind, info) => match kind {
                DatabaseErrorKind::UniqueViolation => Self::UniqueViolation(info.message().to_string()),
                DatabaseErrorKind::CheckViolation => Self::CheckViolation(info.message().to_string()),
                DatabaseErrorKind::ForeignKeyViolation => Self::ForeignKeyViolation(info.message().to_string()),
                DatabaseErrorKind::SerializationFailure => Self::SerializationConflict,
                DatabaseErrorKind::ClosedConnection => Self::TransientIo(info.message().to_string()),
                other => Self::Unknown(format!("db error kind {:?}: {}", other, info.message())),
            },
            DieselError::DeserializationError(e) => Self::Document(format!("deser: {e}")),
            DieselError::SerializationError(e) => Self::Document(format!("ser: {e}")),
            DieselError::BrokenTransactionManager => Self::TransientIo("broken transaction manager".into()),
            other => Self::Unknown(format!("unhandled diesel error: {other:?}")),
        }
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(err: serde_json::Error) -> Self {
        Self::Document(err.to_string())
    }
}

impl From<PersistenceError> for OrchestrationError {
    fn from(err: PersistenceError) -> Self {
        match err {
            PersistenceError::NotFound => Self::NotFound("record".into()),
            PersistenceError::Config(m) => Self::Config(m),
            other => Self::Repository(other.to_string()),
        }
    }
}
