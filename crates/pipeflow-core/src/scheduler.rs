//! Cola de tareas diferidas y políticas de reintento declarativas.
//!
//! Rol en el flujo:
//! - Cada stage es una `TaskKind`; el trabajo a ejecutar es un `TaskEnvelope`
//!   (tarea + ejecución + intento).
//! - "Esperar" siempre es re-encolar con delay, nunca bloquear un worker.
//! - La cola real es externa (at-least-once); `InMemoryScheduler` implementa
//!   el mismo contrato sobre tiempo del `Clock` inyectado.
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::{to_chrono, Clock};
use crate::config::EngineConfig;
use crate::errors::OrchestrationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    Preparation,
    Submission,
    StatusPoll,
    Completion,
    Cleanup,
    Cancellation,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Preparation => "preparation",
            Self::Submission => "submission",
            Self::StatusPoll => "status_poll",
            Self::Completion => "completion",
            Self::Cleanup => "cleanup",
            Self::Cancellation => "cancellation",
        }
    }

    /// Política de reintento declarada para la tarea.
    pub fn retry_policy(self, cfg: &EngineConfig) -> RetryPolicy {
        let connectivity = Backoff { base: cfg.connectivity_backoff_base,
                                     max: cfg.connectivity_backoff_max };
        let api = Backoff { base: cfg.api_backoff_base,
                            max: cfg.api_backoff_max };
        match self {
            Self::Submission | Self::StatusPoll | Self::Cancellation => RetryPolicy { max_retries: cfg.api_max_retries,
                                                                                      backoff: api,
                                                                                      connectivity },
            Self::Preparation | Self::Completion | Self::Cleanup => RetryPolicy { max_retries: cfg.staging_max_retries,
                                                                                 backoff: api,
                                                                                 connectivity },
        }
    }
}

/// Backoff exponencial `base * 2^attempt`, acotado por `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base.checked_mul(factor).unwrap_or(self.max).min(self.max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Reintentos acotados (errores de API / staging); el intento inicial no
    /// cuenta.
    pub max_retries: u32,
    pub backoff: Backoff,
    /// Backoff para fallas de conectividad, sin tope de intentos.
    pub connectivity: Backoff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub task: TaskKind,
    pub execution_id: Uuid,
    /// 0 en la primera entrega; se incrementa con cada reintento por error.
    pub attempt: u32,
}

impl TaskEnvelope {
    pub fn new(task: TaskKind, execution_id: Uuid) -> Self {
        Self { task,
               execution_id,
               attempt: 0 }
    }

    pub fn retry(self) -> Self {
        Self { attempt: self.attempt.saturating_add(1),
               ..self }
    }
}

pub trait Scheduler: Send + Sync {
    fn enqueue(&self, envelope: TaskEnvelope, delay: Duration) -> Result<(), OrchestrationError>;
}

/// Atajo para encolar el primer intento de una tarea.
pub fn enqueue_task(scheduler: &dyn Scheduler,
                    task: TaskKind,
                    execution_id: Uuid,
                    delay: Duration)
                    -> Result<(), OrchestrationError> {
    log::debug!("enqueue task={} execution_id={execution_id} delay_s={}", task.as_str(), delay.as_secs());
    scheduler.enqueue(TaskEnvelope::new(task, execution_id), delay)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledTask {
    pub due_at: DateTime<Utc>,
    pub seq: u64,
    pub envelope: TaskEnvelope,
}

#[derive(Default)]
struct QueueState {
    next_seq: u64,
    tasks: Vec<ScheduledTask>,
}

/// Cola en memoria ordenada por `(due_at, seq)`.
pub struct InMemoryScheduler {
    clock: Arc<dyn Clock>,
    inner: Mutex<QueueState>,
}

impl InMemoryScheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock,
               inner: Mutex::new(QueueState::default()) }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut QueueState) -> T) -> T {
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut guard)
    }

    /// Extrae la siguiente tarea vencida en `now`, si hay.
    pub fn pop_due(&self, now: DateTime<Utc>) -> Option<TaskEnvelope> {
        self.with_state(|q| {
                let idx = q.tasks
                           .iter()
                           .enumerate()
                           .filter(|(_, t)| t.due_at <= now)
                           .min_by_key(|(_, t)| (t.due_at, t.seq))
                           .map(|(i, _)| i)?;
                Some(q.tasks.remove(idx).envelope)
            })
    }

    /// Vencimiento más próximo entre las tareas pendientes.
    pub fn next_due_at(&self) -> Option<DateTime<Utc>> {
        self.with_state(|q| q.tasks.iter().map(|t| t.due_at).min())
    }

    pub fn pending(&self) -> Vec<ScheduledTask> {
        self.with_state(|q| {
                let mut v = q.tasks.clone();
                v.sort_by_key(|t| (t.due_at, t.seq));
                v
            })
    }

    pub fn is_empty(&self) -> bool {
        self.with_state(|q| q.tasks.is_empty())
    }

    /// Tareas pendientes de un tipo para una ejecución.
    pub fn pending_for(&self, execution_id: Uuid, task: TaskKind) -> usize {
        self.with_state(|q| {
                q.tasks
                 .iter()
                 .filter(|t| t.envelope.execution_id == execution_id && t.envelope.task == task)
                 .count()
            })
    }
}

impl Scheduler for InMemoryScheduler {
    fn enqueue(&self, envelope: TaskEnvelope, delay: Duration) -> Result<(), OrchestrationError> {
        let due_at = self.clock.now() + to_chrono(delay);
        self.with_state(|q| {
                let seq = q.next_seq;
                q.next_seq += 1;
                q.tasks.push(ScheduledTask { due_at, seq, envelope });
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn backoff_is_exponential_and_capped() {
        let b = Backoff { base: Duration::from_secs(2),
                          max: Duration::from_secs(30) };
        assert_eq!(b.delay_for(0), Duration::from_secs(2));
        assert_eq!(b.delay_for(1), Duration::from_secs(4));
        assert_eq!(b.delay_for(3), Duration::from_secs(16));
        assert_eq!(b.delay_for(4), Duration::from_secs(30));
        assert_eq!(b.delay_for(200), Duration::from_secs(30));
    }

    #[test]
    fn pops_in_due_order_then_fifo() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let s = InMemoryScheduler::new(clock.clone());
        let id = Uuid::new_v4();
        s.enqueue(TaskEnvelope::new(TaskKind::StatusPoll, id), Duration::from_secs(60)).unwrap();
        s.enqueue(TaskEnvelope::new(TaskKind::Preparation, id), Duration::ZERO).unwrap();
        s.enqueue(TaskEnvelope::new(TaskKind::Submission, id), Duration::ZERO).unwrap();

        let now = clock.now();
        assert_eq!(s.pop_due(now).map(|e| e.task), Some(TaskKind::Preparation));
        assert_eq!(s.pop_due(now).map(|e| e.task), Some(TaskKind::Submission));
        assert_eq!(s.pop_due(now), None);

        clock.advance(Duration::from_secs(60));
        assert_eq!(s.pop_due(clock.now()).map(|e| e.task), Some(TaskKind::StatusPoll));
        assert!(s.is_empty());
    }

    #[test]
    fn api_tasks_use_configured_retry_count() {
        let cfg = EngineConfig::default();
        assert_eq!(TaskKind::Submission.retry_policy(&cfg).max_retries, 3);
        assert_eq!(TaskKind::Completion.retry_policy(&cfg).max_retries, cfg.staging_max_retries);
    }
}
