//! pipeflow-core: orquestación de ejecuciones de pipelines remotos.
//!
//! Creación -> Preparation -> Submission -> Status-Poll (loop) -> Completion
//! -> Cleanup, con Cancellation fuera de banda. Cada stage es una tarea del
//! `Scheduler`; el estado vive en el registro de la ejecución.
pub mod clock;
pub mod config;
pub mod continuable;
pub mod errors;
pub mod formula;
pub mod global_id;
pub mod manifest;
pub mod memory;
pub mod orchestrator;
pub mod ports;
pub mod samplesheet;
pub mod scheduler;
pub mod stages;
pub mod storage;
pub mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{init_dotenv, EngineConfig};
pub use continuable::{ContinuableSteps, StepOutcome};
pub use errors::{classify_error, ErrorClass, OrchestrationError, ServiceError};
pub use formula::{evaluate, runtime_limit_secs, FormulaError};
pub use global_id::GlobalId;
pub use manifest::{flatten, OutputManifest};
pub use memory::{InMemoryBlobStore, InMemoryExecutionRepository, InMemoryPipelineRegistry, RecordingNotifier,
                 ScriptedExecutionService};
pub use orchestrator::{NewExecution, NewSample, Orchestrator};
pub use ports::{BlobStore, ExecutionRepository, ExecutionServiceClient, Notifier, PipelineRegistry, RemoteRunState,
                RunRequest, RunStatus};
pub use samplesheet::{SamplesheetBuilder, StagedSamplesheet};
pub use scheduler::{Backoff, InMemoryScheduler, RetryPolicy, Scheduler, TaskEnvelope, TaskKind};
pub use stages::{Ports, Stage, StageContext, StageOutcome};
pub use storage::StorageBackend;
pub use worker::{TaskResult, Worker};
