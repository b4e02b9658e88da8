//! Worker: despacha `TaskEnvelope`s a las stages y aplica la política de
//! reintentos según la clase de error.
//!
//! - `Transient` (conectividad): re-encola para siempre con backoff acotado.
//! - `RemoteApi(status)`: re-encola hasta `max_retries`; después fuerza
//!   `Error` con `http_error_code = status` y encola Cleanup.
//! - `Retryable` (staging, repositorio): re-encola hasta `max_retries`;
//!   después abandona la tarea sin tocar el estado.
//! - `Permanent`: sin reintento. En Completion deja la ejecución donde está
//!   (`Completing`); en el resto fuerza `Error`.
//! - `Superseded`: el estado cambió bajo la stage; la tarea termina como
//!   `Skipped` sin escribir nada.
use chrono::{DateTime, Utc};

use crate::clock::{Clock, ManualClock};
use crate::errors::{classify_error, ErrorClass, OrchestrationError};
use crate::scheduler::{InMemoryScheduler, TaskEnvelope, TaskKind};
use crate::stages::{fail_execution_by_id, for_kind, StageContext, StageOutcome};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskResult {
    Done(StageOutcome),
    /// Re-encolada con el delay indicado.
    Retried { attempt: u32, delay_secs: u64 },
    /// Reintentos agotados: la ejecución quedó en `Error`.
    Failed(String),
    /// Tarea descartada sin cambiar el estado.
    Dropped(String),
}

pub struct Worker {
    ctx: StageContext,
}

impl Worker {
    pub fn new(ctx: StageContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &StageContext {
        &self.ctx
    }

    pub fn handle(&self, envelope: TaskEnvelope) -> TaskResult {
        log::debug!("handle task={} execution_id={} attempt={}",
                    envelope.task.as_str(),
                    envelope.execution_id,
                    envelope.attempt);
        match for_kind(envelope.task).run(&self.ctx, envelope.execution_id) {
            Ok(outcome) => TaskResult::Done(outcome),
            Err(e) => self.on_error(envelope, e),
        }
    }

    fn on_error(&self, envelope: TaskEnvelope, error: OrchestrationError) -> TaskResult {
        let policy = envelope.task.retry_policy(&self.ctx.config);
        let task = envelope.task.as_str();
        let id = envelope.execution_id;
        match classify_error(&error) {
            ErrorClass::Transient => {
                let delay = policy.connectivity.delay_for(envelope.attempt);
                log::warn!("connectivity failure task={task} execution_id={id} attempt={} retry_in_s={} err={error}",
                           envelope.attempt,
                           delay.as_secs());
                self.retry(envelope, delay)
            }
            ErrorClass::RemoteApi(status) if envelope.attempt < policy.max_retries => {
                let delay = policy.backoff.delay_for(envelope.attempt);
                log::warn!("remote api error task={task} execution_id={id} status={status} attempt={} retry_in_s={}",
                           envelope.attempt,
                           delay.as_secs());
                self.retry(envelope, delay)
            }
            ErrorClass::RemoteApi(status) => {
                let reason = format!("{task} exhausted retries: {error}");
                self.fail(envelope, Some(status), reason)
            }
            ErrorClass::Retryable if envelope.attempt < policy.max_retries => {
                let delay = policy.backoff.delay_for(envelope.attempt);
                log::warn!("retryable failure task={task} execution_id={id} attempt={} err={error}", envelope.attempt);
                self.retry(envelope, delay)
            }
            ErrorClass::Retryable => {
                log::error!("task abandoned task={task} execution_id={id} attempts={} err={error}",
                            envelope.attempt + 1);
                TaskResult::Dropped(error.to_string())
            }
            ErrorClass::Superseded => {
                log::info!("task superseded task={task} execution_id={id} err={error}");
                TaskResult::Done(StageOutcome::Skipped(error.to_string()))
            }
            ErrorClass::Permanent => match envelope.task {
                TaskKind::Completion | TaskKind::Cleanup => {
                    log::error!("task failed without retry task={task} execution_id={id} err={error}");
                    TaskResult::Dropped(error.to_string())
                }
                _ => self.fail(envelope, None, format!("{task} failed: {error}")),
            },
        }
    }

    fn retry(&self, envelope: TaskEnvelope, delay: std::time::Duration) -> TaskResult {
        let next = envelope.retry();
        match self.ctx.ports.scheduler.enqueue(next, delay) {
            Ok(()) => TaskResult::Retried { attempt: next.attempt,
                                            delay_secs: delay.as_secs() },
            Err(e) => {
                log::error!("could not re-enqueue task={} execution_id={} err={e}",
                            envelope.task.as_str(),
                            envelope.execution_id);
                TaskResult::Dropped(e.to_string())
            }
        }
    }

    fn fail(&self, envelope: TaskEnvelope, http_error_code: Option<u16>, reason: String) -> TaskResult {
        match fail_execution_by_id(&self.ctx, envelope.execution_id, http_error_code, &reason) {
            Ok(_) => TaskResult::Failed(reason),
            Err(e) => {
                log::error!("could not mark execution failed execution_id={} err={e}", envelope.execution_id);
                TaskResult::Dropped(e.to_string())
            }
        }
    }

    /// Corre todas las tareas vencidas en `now`.
    pub fn run_due(&self, queue: &InMemoryScheduler, now: DateTime<Utc>) -> Vec<(TaskEnvelope, TaskResult)> {
        let mut results = Vec::new();
        while let Some(envelope) = queue.pop_due(now) {
            results.push((envelope, self.handle(envelope)));
        }
        results
    }

    /// Vacía la cola en tiempo virtual: cuando no hay tareas vencidas, adelanta
    /// el reloj al próximo vencimiento. Corta después de `max_tasks`.
    pub fn drain(&self, queue: &InMemoryScheduler, clock: &ManualClock, max_tasks: usize) -> Vec<(TaskEnvelope, TaskResult)> {
        let mut results = Vec::new();
        while results.len() < max_tasks {
            if let Some(envelope) = queue.pop_due(clock.now()) {
                results.push((envelope, self.handle(envelope)));
                continue;
            }
            match queue.next_due_at() {
                Some(due) => clock.set(due),
                None => break,
            }
        }
        results
    }
}
