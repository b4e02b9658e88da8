mod test_support;

use std::sync::{Arc, Mutex};

use pipeflow_core::{ExecutionRepository, ExecutionServiceClient, Orchestrator, RemoteRunState, RunRequest, RunStatus,
                    ServiceError, StageContext, StageOutcome, TaskKind, TaskResult, Worker};
use pipeflow_domain::{ExecutionState, PipelineSettings};
use test_support::Harness;
use uuid::Uuid;

/// Servicio cuyo `get_status` deja pasar una cancelación del usuario antes
/// de responder `RUNNING`.
struct CancelsWhilePolling {
    orchestrator: Orchestrator,
    execution_id: Uuid,
    cancels: Mutex<Vec<String>>,
}

impl ExecutionServiceClient for CancelsWhilePolling {
    fn submit(&self, _request: &RunRequest) -> Result<String, ServiceError> {
        Ok("run-late".into())
    }

    fn get_status(&self, _run_id: &str) -> Result<RunStatus, ServiceError> {
        let canceling = self.orchestrator.cancel(self.execution_id).expect("user cancel");
        assert_eq!(canceling.state, ExecutionState::Canceling);
        Ok(RunStatus::new(RemoteRunState::Running))
    }

    fn cancel(&self, run_id: &str) -> Result<(), ServiceError> {
        self.cancels.lock().unwrap().push(run_id.to_string());
        Ok(())
    }
}

#[test]
fn cancel_persisted_during_status_call_wins() {
    let h = Harness::new(PipelineSettings::default());
    let (exec, _) = h.create_two_sample_execution();
    h.step().expect("preparation");
    h.step().expect("submission");
    assert_eq!(h.execution(exec.id).state, ExecutionState::Submitted);

    let service = Arc::new(CancelsWhilePolling { orchestrator: Orchestrator::new(h.worker.context().clone()),
                                                 execution_id: exec.id,
                                                 cancels: Mutex::new(Vec::new()) });
    let client: Arc<dyn ExecutionServiceClient> = service.clone();
    let mut ports = h.worker.context().ports.clone();
    ports.execution_service = client;
    let racing = Worker::new(StageContext::new(ports, h.worker.context().config.clone()));

    let results = racing.drain(&h.queue, &h.clock, 50);
    let (first, outcome) = &results[0];
    assert_eq!(first.task, TaskKind::StatusPoll);
    assert!(matches!(outcome, TaskResult::Done(StageOutcome::Skipped(_))), "{outcome:?}");

    let e = h.execution(exec.id);
    assert_eq!(e.state, ExecutionState::Canceled);
    assert!(e.cleaned);
    assert_eq!(*service.cancels.lock().unwrap(), vec!["run-1".to_string()]);
    assert!(h.blobs.keys_with_prefix("runs/").is_empty());

    let path: Vec<_> = h.repo.state_changes(exec.id).unwrap().iter().map(|c| (c.from, c.to)).collect();
    assert!(path.contains(&(ExecutionState::Submitted, ExecutionState::Canceling)));
    assert!(!path.iter().any(|(_, to)| matches!(to, ExecutionState::Running | ExecutionState::Error)));
    assert_eq!(h.queue.pending_for(exec.id, TaskKind::StatusPoll), 0);
}
