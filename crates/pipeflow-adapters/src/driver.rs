//! Driver en tiempo real: cada `tick` corre en un hilo bloqueante las tareas
//! vencidas de la cola en memoria.
//!
//! Las stages son síncronas (repositorio, blob store y cliente remoto son
//! bloqueantes), así que el loop async sólo marca el ritmo y delega en
//! `spawn_blocking`.
use std::sync::Arc;
use std::time::Duration;

use pipeflow_core::{Clock, InMemoryScheduler, TaskResult, Worker};
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DriverStats {
    pub ticks: u64,
    pub tasks: u64,
    /// Tareas que terminaron en `Failed` o `Dropped`.
    pub failures: u64,
}

pub struct RealtimeDriver {
    worker: Arc<Worker>,
    queue: Arc<InMemoryScheduler>,
    clock: Arc<dyn Clock>,
    tick: Duration,
}

impl RealtimeDriver {
    pub fn new(worker: Arc<Worker>, queue: Arc<InMemoryScheduler>, clock: Arc<dyn Clock>, tick: Duration) -> Self {
        Self { worker,
               queue,
               clock,
               tick }
    }

    async fn tick_once(&self, stats: &mut DriverStats) {
        let worker = self.worker.clone();
        let queue = self.queue.clone();
        let now = self.clock.now();
        stats.ticks += 1;
        match tokio::task::spawn_blocking(move || worker.run_due(&queue, now)).await {
            Ok(results) => {
                for (envelope, result) in results {
                    stats.tasks += 1;
                    if matches!(result, TaskResult::Failed(_) | TaskResult::Dropped(_)) {
                        stats.failures += 1;
                        log::warn!("task did not complete task={} execution_id={} result={result:?}",
                                   envelope.task.as_str(),
                                   envelope.execution_id);
                    }
                }
            }
            Err(e) => log::error!("worker tick panicked err={e}"),
        }
    }

    /// Corre hasta que `shutdown` pase a `true` (o se cierre el canal).
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> DriverStats {
        let mut stats = DriverStats::default();
        let mut ticker = time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        log::info!("driver started tick_ms={}", self.tick.as_millis());
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => self.tick_once(&mut stats).await,
            }
        }
        log::info!("driver stopped ticks={} tasks={} failures={}", stats.ticks, stats.tasks, stats.failures);
        stats
    }

    /// Corre ticks hasta vaciar la cola o llegar a `max_ticks`.
    pub async fn run_until_idle(&self, max_ticks: u64) -> DriverStats {
        let mut stats = DriverStats::default();
        let mut ticker = time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        while stats.ticks < max_ticks && !self.queue.is_empty() {
            ticker.tick().await;
            self.tick_once(&mut stats).await;
        }
        stats
    }
}
