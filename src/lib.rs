//! PipeFlow Rust Library
//!
//! Fachada del workspace:
//! - Re-exporta los crates `pipeflow-domain`, `pipeflow-core`,
//!   `pipeflow-persistence` y `pipeflow-adapters`.
//! - Expone `errors` con el error de nivel aplicación (`CoreError`).
//! - `local_engine` arma un `StageContext` sobre disco local y un registry JSON.

pub mod errors;

use std::path::Path;
use std::sync::Arc;

pub use pipeflow_adapters;
pub use pipeflow_core;
pub use pipeflow_domain;
pub use pipeflow_persistence;

use pipeflow_adapters::{JsonPipelineRegistry, LocalFsBlobStore};
use pipeflow_core::{Clock, EngineConfig, ExecutionRepository, ExecutionServiceClient, InMemoryScheduler, Notifier,
                    Orchestrator, Ports, StageContext, Worker};

use crate::errors::CoreError;

/// Motor listo para usar: orquestador, worker y la cola que comparten.
pub struct LocalEngine {
    pub orchestrator: Orchestrator,
    pub worker: Arc<Worker>,
    pub queue: Arc<InMemoryScheduler>,
    pub blobs: Arc<LocalFsBlobStore>,
}

/// Arma el motor con blobs en `storage_root` y pipelines leídos de `registry_path`.
///
/// El repositorio, el cliente remoto y el notificador los aporta quien llama.
pub fn local_engine(storage_root: &Path,
                    registry_path: &Path,
                    repository: Arc<dyn ExecutionRepository>,
                    execution_service: Arc<dyn ExecutionServiceClient>,
                    notifier: Arc<dyn Notifier>,
                    clock: Arc<dyn Clock>,
                    config: EngineConfig)
                    -> Result<LocalEngine, CoreError> {
    let blobs = Arc::new(LocalFsBlobStore::new(storage_root)?);
    let registry = JsonPipelineRegistry::from_path(registry_path)?;
    if registry.is_empty() {
        return Err(CoreError::Config(format!("registry {} has no pipelines", registry_path.display())));
    }
    let queue = Arc::new(InMemoryScheduler::new(clock.clone()));
    let ports = Ports { repository,
                        blobs: blobs.clone(),
                        execution_service,
                        registry: Arc::new(registry),
                        scheduler: queue.clone(),
                        clock,
                        notifier };
    let ctx = StageContext::new(ports, config);
    log::info!("local engine ready storage_root={}", storage_root.display());
    Ok(LocalEngine { orchestrator: Orchestrator::new(ctx.clone()),
                     worker: Arc::new(Worker::new(ctx)),
                     queue,
                     blobs })
}
