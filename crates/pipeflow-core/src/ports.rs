//! Contratos de los colaboradores externos del motor.
//!
//! Todo lo que no es lógica de orquestación (persistencia de registros, blob
//! store, servicio de ejecución remoto, registry de pipelines, notificaciones)
//! entra por estos traits. Las implementaciones en memoria viven en
//! `crate::memory`; Postgres en `pipeflow-persistence`.
use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use pipeflow_domain::{Activity, Attachable, Attachment, BlobRef, ExecutionState, PipelineDefinition, Sample,
                      SamplesWorkflowExecution, StateChange, WorkflowExecution, WorkflowRef};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::{OrchestrationError, ServiceError};

/// Cuerpo de un run para el servicio remoto.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    pub workflow_params: Value,
    pub workflow_type: String,
    pub workflow_type_version: String,
    pub workflow_engine: String,
    pub workflow_engine_version: String,
    pub workflow_engine_parameters: IndexMap<String, String>,
    pub workflow_url: String,
    pub tags: IndexMap<String, String>,
}

/// Estados del servicio remoto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemoteRunState {
    Unknown,
    Queued,
    Initializing,
    Running,
    Paused,
    Complete,
    ExecutorError,
    SystemError,
    Canceled,
    Canceling,
    Preempted,
}

impl RemoteRunState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Queued => "QUEUED",
            Self::Initializing => "INITIALIZING",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Complete => "COMPLETE",
            Self::ExecutorError => "EXECUTOR_ERROR",
            Self::SystemError => "SYSTEM_ERROR",
            Self::Canceled => "CANCELED",
            Self::Canceling => "CANCELING",
            Self::Preempted => "PREEMPTED",
        }
    }
}

impl fmt::Display for RemoteRunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RemoteRunState {
    type Err = std::convert::Infallible;

    /// Códigos desconocidos se tratan como `Unknown`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_uppercase().as_str() {
            "QUEUED" => Self::Queued,
            "INITIALIZING" => Self::Initializing,
            "RUNNING" => Self::Running,
            "PAUSED" => Self::Paused,
            "COMPLETE" => Self::Complete,
            "EXECUTOR_ERROR" => Self::ExecutorError,
            "SYSTEM_ERROR" => Self::SystemError,
            "CANCELED" => Self::Canceled,
            "CANCELING" => Self::Canceling,
            "PREEMPTED" => Self::Preempted,
            _ => Self::Unknown,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatus {
    pub state: RemoteRunState,
    pub detail: Option<String>,
}

impl RunStatus {
    pub fn new(state: RemoteRunState) -> Self {
        Self { state, detail: None }
    }
}

/// Cliente del servicio de ejecución remoto (HTTP en producción).
pub trait ExecutionServiceClient: Send + Sync {
    fn submit(&self, request: &RunRequest) -> Result<String, ServiceError>;
    fn get_status(&self, run_id: &str) -> Result<RunStatus, ServiceError>;
    fn cancel(&self, run_id: &str) -> Result<(), ServiceError>;
}

pub trait BlobStore: Send + Sync {
    /// Guarda bajo una clave content-addressed.
    fn put(&self, bytes: &[u8], filename: &str) -> Result<BlobRef, OrchestrationError>;
    fn put_with_key(&self, key: &str, bytes: &[u8], filename: &str) -> Result<BlobRef, OrchestrationError>;
    fn get(&self, key: &str) -> Result<Vec<u8>, OrchestrationError>;
    fn exists(&self, key: &str) -> Result<bool, OrchestrationError>;
    /// Copia el contenido de `source_key` a `new_key`; pisa si ya existe.
    fn copy_with_key(&self, source_key: &str, new_key: &str) -> Result<BlobRef, OrchestrationError>;
    /// URI propia del backend (`s3://`, `az://`, `gcs://` o ruta local).
    fn resolve_uri(&self, key: &str) -> String;
    /// Borra todo lo que empiece con `prefix`; devuelve cuántos blobs borró.
    fn delete_prefix(&self, prefix: &str) -> Result<usize, OrchestrationError>;
}

pub trait PipelineRegistry: Send + Sync {
    fn find(&self, workflow: &WorkflowRef) -> Option<PipelineDefinition>;
}

/// Persistencia de registros del dominio.
///
/// Contrato: `samples_workflow_executions` devuelve los join records
/// ordenados por `position`; los steps continuables dependen de ese orden.
pub trait ExecutionRepository: Send + Sync {
    fn insert_execution(&self,
                        execution: &WorkflowExecution,
                        samples: &[SamplesWorkflowExecution])
                        -> Result<(), OrchestrationError>;
    fn get_execution(&self, id: Uuid) -> Result<WorkflowExecution, OrchestrationError>;
    fn save_execution(&self, execution: &WorkflowExecution) -> Result<(), OrchestrationError>;
    /// Compare-and-set: guarda sólo si el estado persistido sigue siendo
    /// `expected`. `Ok(false)` cuando otro actor lo cambió (no escribe nada).
    fn save_execution_if(&self, execution: &WorkflowExecution, expected: ExecutionState) -> Result<bool, OrchestrationError>;

    fn append_state_change(&self, change: &StateChange) -> Result<(), OrchestrationError>;
    fn state_changes(&self, execution_id: Uuid) -> Result<Vec<StateChange>, OrchestrationError>;

    fn samples_workflow_executions(&self, execution_id: Uuid) -> Result<Vec<SamplesWorkflowExecution>, OrchestrationError>;
    fn save_samples_workflow_execution(&self, swe: &SamplesWorkflowExecution) -> Result<(), OrchestrationError>;

    fn get_sample(&self, id: Uuid) -> Result<Sample, OrchestrationError>;
    fn save_sample(&self, sample: &Sample) -> Result<(), OrchestrationError>;

    fn get_attachment(&self, id: Uuid) -> Result<Option<Attachment>, OrchestrationError>;
    fn create_attachment(&self, attachment: &Attachment) -> Result<(), OrchestrationError>;
    fn attachments_for(&self, attachable: Attachable) -> Result<Vec<Attachment>, OrchestrationError>;

    fn create_activity(&self, activity: &Activity) -> Result<(), OrchestrationError>;
    fn activities_for(&self, trackable_id: Uuid) -> Result<Vec<Activity>, OrchestrationError>;
}

/// Entrega de notificaciones (email) al terminar una ejecución.
pub trait Notifier: Send + Sync {
    fn execution_finished(&self, execution: &WorkflowExecution) -> Result<(), OrchestrationError>;
}
