//! pipeflow-domain: registros del orquestador de ejecuciones de pipelines.
//!
//! Contiene los agregados persistidos (`WorkflowExecution`,
//! `SamplesWorkflowExecution`), las entidades externas que el motor lee o crea
//! (`Sample`, `Attachment`, `Activity`), la definición de pipelines del
//! registry y la máquina de estados pura.
pub mod activity;
pub mod attachment;
pub mod error;
pub mod execution;
pub mod pipeline;
pub mod samples;
pub mod state;

pub use activity::Activity;
pub use attachment::{Attachable, AttachableKind, Attachment, AttachmentFormat, AttachmentMetadata, BlobRef};
pub use error::DomainError;
pub use execution::{Checkpoint, NamespaceKind, NamespaceRef, PrincipalKind, Submitter, WorkflowExecution, WorkflowRef};
pub use pipeline::{EngineDescriptor, ParamKind, ParamSpec, PipelineDefinition, PipelineSettings, RuntimeLimit};
pub use samples::{MetadataProvenance, ProvenanceSource, Sample, SamplesWorkflowExecution};
pub use state::{entered_at, transition, ExecutionEvent, ExecutionState, StateChange, TransitionError};
