//! Stages del ciclo de vida de una ejecución.
//!
//! Rol en el flujo:
//! - Cada stage es una tarea independiente encolada en el `Scheduler`; recibe
//!   sólo el id de la ejecución y relee el registro al entrar.
//! - Orden de guardas al entrar: (1) `Canceling`/`Canceled` no hace nada,
//!   (2) estado terminal no hace nada, (3) estado igual o posterior al que la
//!   stage produce no hace nada (entrega duplicada), (4) estado inconsistente
//!   con lo que la stage necesita fuerza `Error` y encola Cleanup.
//! - Las stages son las únicas que mutan `state`; toda transición pasa por
//!   `record_transition`, que escribe con compare-and-set sobre el estado
//!   leído. Si otro actor movió el estado entretanto la escritura se descarta
//!   con `OrchestrationError::Superseded`.
use std::sync::Arc;
use std::time::Duration;

use pipeflow_domain::{ExecutionEvent, ExecutionState, PipelineDefinition, StateChange, WorkflowExecution};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::errors::OrchestrationError;
use crate::ports::{BlobStore, ExecutionRepository, ExecutionServiceClient, Notifier, PipelineRegistry};
use crate::scheduler::{enqueue_task, Scheduler, TaskKind};

pub mod cancellation;
pub mod cleanup;
pub mod completion;
pub mod preparation;
pub mod status_poll;
pub mod submission;

pub use cancellation::CancellationStage;
pub use cleanup::CleanupStage;
pub use completion::CompletionStage;
pub use preparation::PreparationStage;
pub use status_poll::StatusPollStage;
pub use submission::SubmissionStage;

/// Colaboradores externos inyectados en las stages.
#[derive(Clone)]
pub struct Ports {
    pub repository: Arc<dyn ExecutionRepository>,
    pub blobs: Arc<dyn BlobStore>,
    pub execution_service: Arc<dyn ExecutionServiceClient>,
    pub registry: Arc<dyn PipelineRegistry>,
    pub scheduler: Arc<dyn Scheduler>,
    pub clock: Arc<dyn Clock>,
    pub notifier: Arc<dyn Notifier>,
}

#[derive(Clone)]
pub struct StageContext {
    pub ports: Ports,
    pub config: EngineConfig,
}

impl StageContext {
    pub fn new(ports: Ports, config: EngineConfig) -> Self {
        Self { ports, config }
    }

    pub fn pipeline_for(&self, execution: &WorkflowExecution) -> Result<PipelineDefinition, OrchestrationError> {
        let wf = &execution.workflow;
        self.ports
            .registry
            .find(wf)
            .ok_or_else(|| OrchestrationError::Validation(format!("pipeline {}@{} is not registered", wf.name, wf.version)))
    }

    /// Intervalo de poll del pipeline o el default de la config.
    pub fn status_check_interval(&self, pipeline: Option<&PipelineDefinition>) -> Duration {
        pipeline.and_then(|p| p.settings.status_check_interval)
                .map(Duration::from_secs)
                .unwrap_or(self.config.default_status_check_interval)
    }

    pub fn enqueue(&self, task: TaskKind, execution_id: Uuid, delay: Duration) -> Result<(), OrchestrationError> {
        enqueue_task(self.ports.scheduler.as_ref(), task, execution_id, delay)
    }
}

/// Resultado observable de una corrida de stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// La stage hizo su trabajo y dejó la ejecución en este estado.
    Advanced(ExecutionState),
    /// La stage se re-encoló a sí misma.
    Rescheduled(Duration),
    /// La stage no hizo nada (cancelada, terminal, ya limpia...).
    Skipped(String),
    /// La stage forzó `Error` y encoló Cleanup.
    Failed(String),
}

pub trait Stage: Send + Sync {
    fn kind(&self) -> TaskKind;
    fn run(&self, ctx: &StageContext, execution_id: Uuid) -> Result<StageOutcome, OrchestrationError>;
}

/// Stage que atiende cada tipo de tarea.
pub fn for_kind(kind: TaskKind) -> &'static dyn Stage {
    match kind {
        TaskKind::Preparation => &PreparationStage,
        TaskKind::Submission => &SubmissionStage,
        TaskKind::StatusPoll => &StatusPollStage,
        TaskKind::Completion => &CompletionStage,
        TaskKind::Cleanup => &CleanupStage,
        TaskKind::Cancellation => &CancellationStage,
    }
}

pub(crate) enum Guard {
    Proceed(WorkflowExecution),
    Stop(StageOutcome),
}

/// Guardas comunes de entrada (ver doc del módulo). `produces` es el estado
/// en que la stage deja la ejecución; `required` valida lo que necesita.
pub(crate) fn guard<F>(ctx: &StageContext,
                       task: TaskKind,
                       execution_id: Uuid,
                       produces: ExecutionState,
                       required: F)
                       -> Result<Guard, OrchestrationError>
    where F: Fn(&WorkflowExecution) -> bool
{
    let execution = ctx.ports.repository.get_execution(execution_id)?;
    // Cancellation es la única stage que atiende `Canceling`.
    if execution.state.is_cancel_path() && task != TaskKind::Cancellation {
        log::debug!("skip task={} execution_id={execution_id} state={}", task.as_str(), execution.state);
        return Ok(Guard::Stop(StageOutcome::Skipped(format!("execution is {}", execution.state))));
    }
    if execution.state.is_terminal() {
        log::debug!("duplicate delivery task={} execution_id={execution_id} state={}", task.as_str(), execution.state);
        return Ok(Guard::Stop(StageOutcome::Skipped(format!("execution already {}", execution.state))));
    }
    if execution.state.has_reached(produces) {
        log::debug!("duplicate delivery task={} execution_id={execution_id} state={}", task.as_str(), execution.state);
        return Ok(Guard::Stop(StageOutcome::Skipped(format!("execution already {}", execution.state))));
    }
    if !required(&execution) {
        let reason = format!("{} cannot run while execution is {}", task.as_str(), execution.state);
        let outcome = fail_execution(ctx, execution, None, &reason)?;
        return Ok(Guard::Stop(outcome));
    }
    Ok(Guard::Proceed(execution))
}

/// Aplica `event`, persiste el registro y agrega la entrada al change log si
/// el estado cambió.
pub fn record_transition(ctx: &StageContext,
                         execution: &mut WorkflowExecution,
                         event: ExecutionEvent)
                         -> Result<StateChange, OrchestrationError> {
    let change = execution.apply(event, ctx.ports.clock.now())?;
    if !ctx.ports.repository.save_execution_if(execution, change.from)? {
        let actual = ctx.ports.repository.get_execution(execution.id)?.state;
        log::info!("transition superseded execution_id={} expected={} actual={actual} event={event:?}",
                   execution.id,
                   change.from);
        return Err(OrchestrationError::Superseded { expected: change.from,
                                                    actual });
    }
    if change.from != change.to {
        ctx.ports.repository.append_state_change(&change)?;
        log::info!("transition execution_id={} from={} to={}", execution.id, change.from, change.to);
    }
    Ok(change)
}

/// Fuerza `Error` (con código HTTP si lo hay), notifica y encola Cleanup.
/// No hace nada si la ejecución ya es terminal o si su estado cambió desde
/// que se leyó (p. ej. una cancelación del usuario).
pub fn fail_execution(ctx: &StageContext,
                      mut execution: WorkflowExecution,
                      http_error_code: Option<u16>,
                      reason: &str)
                      -> Result<StageOutcome, OrchestrationError> {
    let Some(change) = execution.force_error(http_error_code, ctx.ports.clock.now()) else {
        return Ok(StageOutcome::Skipped(format!("execution already {}", execution.state)));
    };
    if !ctx.ports.repository.save_execution_if(&execution, change.from)? {
        log::info!("failure superseded execution_id={} expected={} reason={reason}", execution.id, change.from);
        return Ok(StageOutcome::Skipped(format!("execution left {} before it could fail", change.from)));
    }
    ctx.ports.repository.append_state_change(&change)?;
    log::error!("execution failed execution_id={} from={} http_error_code={:?} reason={reason}",
                execution.id,
                change.from,
                execution.http_error_code);
    notify_if_requested(ctx, &execution);
    ctx.enqueue(TaskKind::Cleanup, execution.id, Duration::ZERO)?;
    Ok(StageOutcome::Failed(reason.to_string()))
}

/// Variante que carga el registro por id; usada por el worker al agotar
/// reintentos.
pub fn fail_execution_by_id(ctx: &StageContext,
                            execution_id: Uuid,
                            http_error_code: Option<u16>,
                            reason: &str)
                            -> Result<StageOutcome, OrchestrationError> {
    let execution = ctx.ports.repository.get_execution(execution_id)?;
    fail_execution(ctx, execution, http_error_code, reason)
}

/// Avisa al notifier en `Completed`/`Error` si la ejecución lo pidió. Una
/// falla de notificación no afecta a la ejecución.
pub(crate) fn notify_if_requested(ctx: &StageContext, execution: &WorkflowExecution) {
    if !execution.email_notification {
        return;
    }
    if !matches!(execution.state, ExecutionState::Completed | ExecutionState::Error) {
        return;
    }
    if let Err(e) = ctx.ports.notifier.execution_finished(execution) {
        log::warn!("notification failed execution_id={} err={e}", execution.id);
    }
}
