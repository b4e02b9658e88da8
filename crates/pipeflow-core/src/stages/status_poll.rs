//! Status-Poll: consulta el run remoto y decide la próxima stage.
//!
//! Reglas, en orden:
//! 1. `Canceling`/`Canceled`: nada (guarda común).
//! 2. Local `Running` sin cumplir `min_runtime`: re-encola tras
//!    `max(restante, intervalo)` sin llamar al servicio remoto.
//! 3. Consulta el estado remoto y lo mapea al local.
//! 4. En `Running`, el tiempo transcurrido sale del change log durable; si
//!    supera `max_runtime` pasa a `Canceling` y encola Cancellation.
//! 5. Estados terminales encolan Completion o Cleanup.
use std::time::Duration;

use pipeflow_domain::{entered_at, ExecutionEvent, ExecutionState, PipelineDefinition, RuntimeLimit, WorkflowExecution};
use uuid::Uuid;

use super::{guard, notify_if_requested, record_transition, Guard, Stage, StageContext, StageOutcome};
use crate::clock::elapsed_between;
use crate::errors::OrchestrationError;
use crate::formula::runtime_limit_secs;
use crate::ports::RemoteRunState;
use crate::scheduler::TaskKind;

pub struct StatusPollStage;

/// Traducción de un estado remoto a un evento local; `None` deja el estado.
pub fn remote_event(state: RemoteRunState) -> Option<ExecutionEvent> {
    match state {
        RemoteRunState::Running => Some(ExecutionEvent::RemoteRunning),
        RemoteRunState::Complete => Some(ExecutionEvent::RemoteComplete),
        RemoteRunState::Canceled | RemoteRunState::Canceling => Some(ExecutionEvent::RemoteCanceled),
        RemoteRunState::ExecutorError | RemoteRunState::SystemError | RemoteRunState::Preempted => {
            Some(ExecutionEvent::RemoteFailed)
        }
        RemoteRunState::Queued | RemoteRunState::Initializing | RemoteRunState::Paused | RemoteRunState::Unknown => None,
    }
}

fn limit_secs(limit: Option<&RuntimeLimit>, sample_count: usize) -> Result<Option<Duration>, OrchestrationError> {
    match limit {
        Some(l) => Ok(Some(Duration::from_secs(runtime_limit_secs(l, sample_count)?))),
        None => Ok(None),
    }
}

impl StatusPollStage {
    /// Tiempo en `Running` según el change log.
    fn time_running(ctx: &StageContext, execution: &WorkflowExecution) -> Result<Duration, OrchestrationError> {
        let changes = ctx.ports.repository.state_changes(execution.id)?;
        let since = entered_at(&changes, ExecutionState::Running).unwrap_or(execution.updated_at);
        Ok(elapsed_between(since, ctx.ports.clock.now()))
    }

    fn reschedule(ctx: &StageContext, execution_id: Uuid, delay: Duration) -> Result<StageOutcome, OrchestrationError> {
        ctx.enqueue(TaskKind::StatusPoll, execution_id, delay)?;
        Ok(StageOutcome::Rescheduled(delay))
    }

    fn check_max_runtime(ctx: &StageContext,
                         execution: &mut WorkflowExecution,
                         pipeline: &PipelineDefinition,
                         sample_count: usize,
                         interval: Duration)
                         -> Result<StageOutcome, OrchestrationError> {
        if let Some(max) = limit_secs(pipeline.settings.max_runtime.as_ref(), sample_count)? {
            let running_for = Self::time_running(ctx, execution)?;
            if running_for > max {
                log::warn!("max runtime exceeded execution_id={} running_s={} max_s={}",
                           execution.id,
                           running_for.as_secs(),
                           max.as_secs());
                record_transition(ctx, execution, ExecutionEvent::CancelRequested)?;
                ctx.enqueue(TaskKind::Cancellation, execution.id, Duration::ZERO)?;
                return Ok(StageOutcome::Advanced(execution.state));
            }
        }
        Self::reschedule(ctx, execution.id, interval)
    }
}

impl Stage for StatusPollStage {
    fn kind(&self) -> TaskKind {
        TaskKind::StatusPoll
    }

    fn run(&self, ctx: &StageContext, execution_id: Uuid) -> Result<StageOutcome, OrchestrationError> {
        let mut execution = match guard(ctx, self.kind(), execution_id, ExecutionState::Completing, |e| {
                                    matches!(e.state, ExecutionState::Submitted | ExecutionState::Running) && e.run_id.is_some()
                                })? {
            Guard::Proceed(e) => e,
            Guard::Stop(outcome) => return Ok(outcome),
        };
        let pipeline = ctx.pipeline_for(&execution)?;
        let interval = ctx.status_check_interval(Some(&pipeline));
        let sample_count = ctx.ports.repository.samples_workflow_executions(execution.id)?.len();

        if execution.state == ExecutionState::Running {
            if let Some(min) = limit_secs(pipeline.settings.min_runtime.as_ref(), sample_count)? {
                let running_for = Self::time_running(ctx, &execution)?;
                if running_for < min {
                    let delay = (min - running_for).max(interval);
                    log::debug!("min runtime gate execution_id={} running_s={} delay_s={}",
                                execution.id,
                                running_for.as_secs(),
                                delay.as_secs());
                    return Self::reschedule(ctx, execution.id, delay);
                }
            }
        }

        let run_id = execution.run_id.clone().unwrap_or_default();
        let status = ctx.ports.execution_service.get_status(&run_id)?;
        log::debug!("remote status execution_id={} run_id={run_id} state={}", execution.id, status.state);

        if let Some(event) = remote_event(status.state) {
            record_transition(ctx, &mut execution, event)?;
        }

        match execution.state {
            ExecutionState::Completing => {
                ctx.enqueue(TaskKind::Completion, execution.id, Duration::ZERO)?;
                Ok(StageOutcome::Advanced(execution.state))
            }
            ExecutionState::Canceled => {
                ctx.enqueue(TaskKind::Cleanup, execution.id, Duration::ZERO)?;
                Ok(StageOutcome::Advanced(execution.state))
            }
            ExecutionState::Error => {
                log::error!("remote run failed execution_id={} run_id={run_id} remote_state={} detail={:?}",
                            execution.id,
                            status.state,
                            status.detail);
                notify_if_requested(ctx, &execution);
                ctx.enqueue(TaskKind::Cleanup, execution.id, Duration::ZERO)?;
                Ok(StageOutcome::Advanced(execution.state))
            }
            ExecutionState::Running => Self::check_max_runtime(ctx, &mut execution, &pipeline, sample_count, interval),
            _ => Self::reschedule(ctx, execution.id, interval),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_mapping_covers_every_code() {
        assert_eq!(remote_event(RemoteRunState::Running), Some(ExecutionEvent::RemoteRunning));
        assert_eq!(remote_event(RemoteRunState::Complete), Some(ExecutionEvent::RemoteComplete));
        assert_eq!(remote_event(RemoteRunState::Canceling), Some(ExecutionEvent::RemoteCanceled));
        assert_eq!(remote_event(RemoteRunState::Preempted), Some(ExecutionEvent::RemoteFailed));
        assert_eq!(remote_event(RemoteRunState::Queued), None);
        assert_eq!(remote_event(RemoteRunState::Unknown), None);
    }
}
