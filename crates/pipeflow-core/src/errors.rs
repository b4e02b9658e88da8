//! Errores del orquestador y su clasificación para la política de reintentos.

use pipeflow_domain::{DomainError, ExecutionState, TransitionError};
use thiserror::Error;

use crate::formula::FormulaError;

/// Error devuelto por el cliente del servicio de ejecución remoto.
///
/// Las dos variantes son deliberadamente distintas: la conectividad se
/// reintenta sin límite, los errores de API un número acotado de veces.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("connection to execution service failed: {0}")]
    Connectivity(String),
    #[error("execution service responded {status}: {message}")]
    Api { status: u16, message: String },
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum OrchestrationError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("connectivity failure: {0}")]
    Connectivity(String),
    #[error("remote api error {status}: {message}")]
    RemoteApi { status: u16, message: String },
    #[error("output manifest error: {0}")]
    Manifest(String),
    #[error("blob staging error: {0}")]
    Staging(String),
    #[error("repository error: {0}")]
    Repository(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("scheduler error: {0}")]
    Scheduler(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Formula(#[from] FormulaError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    /// Otro actor (cancelación del usuario, entrega concurrente) cambió el
    /// estado entre la lectura y la escritura.
    #[error("execution state moved from {expected} to {actual}")]
    Superseded { expected: ExecutionState, actual: ExecutionState },
}

impl From<ServiceError> for OrchestrationError {
    fn from(e: ServiceError) -> Self {
        match e {
            ServiceError::Connectivity(m) => Self::Connectivity(m),
            ServiceError::Api { status, message } => Self::RemoteApi { status, message },
        }
    }
}

impl From<DomainError> for OrchestrationError {
    fn from(e: DomainError) -> Self {
        match e {
            DomainError::ValidationError(m) => Self::Validation(m),
            DomainError::SerializationError(m) => Self::Repository(m),
        }
    }
}

/// Clase de error que decide la política del worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Reintento indefinido con backoff exponencial.
    Transient,
    /// Reintento acotado; al agotarse la ejecución pasa a `Error` con el código.
    RemoteApi(u16),
    /// Reintento acotado; al agotarse se abandona la tarea sin tocar el estado.
    Retryable,
    /// Sin reintento.
    Permanent,
    /// El estado cambió por debajo de la stage: la tarea se descarta sin
    /// tocar nada; la stage que corresponda al nuevo estado ya está encolada.
    Superseded,
}

pub fn classify_error(e: &OrchestrationError) -> ErrorClass {
    match e {
        OrchestrationError::Connectivity(_) => ErrorClass::Transient,
        OrchestrationError::RemoteApi { status, .. } => ErrorClass::RemoteApi(*status),
        OrchestrationError::Staging(_) | OrchestrationError::Repository(_) | OrchestrationError::Scheduler(_) => {
            ErrorClass::Retryable
        }
        OrchestrationError::Validation(_)
        | OrchestrationError::Manifest(_)
        | OrchestrationError::NotFound(_)
        | OrchestrationError::Config(_)
        | OrchestrationError::Formula(_)
        | OrchestrationError::Transition(_) => ErrorClass::Permanent,
        OrchestrationError::Superseded { .. } => ErrorClass::Superseded,
    }
}
