mod test_support;

use pipeflow_core::{EngineConfig, ServiceError, TaskKind, TaskResult};
use pipeflow_domain::{ExecutionState, PipelineSettings};
use test_support::Harness;

fn api(status: u16) -> ServiceError {
    ServiceError::Api { status,
                        message: "boom".into() }
}

#[test]
fn connectivity_failures_retry_forever_without_touching_state() {
    let h = Harness::new(PipelineSettings::default());
    let (exec, _) = h.create_two_sample_execution();
    h.step().expect("preparation");
    h.step().expect("submission");
    for _ in 0..100 {
        h.service.push_status(Err(ServiceError::Connectivity("connection refused".into())));
    }

    let mut last = None;
    for _ in 0..100 {
        let (env, result) = h.step().expect("status poll");
        assert_eq!(env.task, TaskKind::StatusPoll);
        assert!(matches!(result, TaskResult::Retried { .. }), "{result:?}");
        assert_eq!(h.execution(exec.id).state, ExecutionState::Submitted);
        last = Some(result);
    }
    assert_eq!(last, Some(TaskResult::Retried { attempt: 100,
                                                delay_secs: 60 }));
    assert_eq!(h.service.status_calls(), 100);

    h.step().expect("recovered poll");
    assert_eq!(h.execution(exec.id).state, ExecutionState::Running);
}

#[test]
fn submission_gives_up_after_bounded_api_retries() {
    let h = Harness::new(PipelineSettings::default());
    let (exec, _) = h.create_two_sample_execution();
    for _ in 0..4 {
        h.service.push_submit(Err(api(500)));
    }

    let results = h.drain();
    let submissions: Vec<&TaskResult> =
        results.iter().filter(|(env, _)| env.task == TaskKind::Submission).map(|(_, r)| r).collect();
    assert_eq!(submissions.len(), 4);
    assert_eq!(submissions[0], &TaskResult::Retried { attempt: 1,
                                                      delay_secs: 1 });
    assert_eq!(submissions[2], &TaskResult::Retried { attempt: 3,
                                                      delay_secs: 4 });
    assert!(matches!(submissions[3], TaskResult::Failed(_)));
    assert!(results.iter().any(|(env, _)| env.task == TaskKind::Cleanup));

    let e = h.execution(exec.id);
    assert_eq!(e.state, ExecutionState::Error);
    assert_eq!(e.http_error_code, Some(500));
    assert!(e.run_id.is_none());
    assert!(e.cleaned);
    assert_eq!(h.service.submit_calls(), 4);
    assert_eq!(h.notifier.sent(), vec![(exec.id, ExecutionState::Error)]);
}

#[test]
fn a_transient_api_error_is_absorbed_by_a_retry() {
    let h = Harness::new(PipelineSettings::default());
    let (exec, _) = h.create_two_sample_execution();
    h.service.push_submit(Err(api(503)));
    h.step().expect("preparation");

    let (_, first) = h.step().expect("submission");
    assert_eq!(first, TaskResult::Retried { attempt: 1,
                                            delay_secs: 1 });
    h.step().expect("submission retry");
    let e = h.execution(exec.id);
    assert_eq!(e.state, ExecutionState::Submitted);
    assert!(e.http_error_code.is_none());
    assert_eq!(h.service.submit_calls(), 2);
}

#[test]
fn status_poll_api_errors_record_the_last_status_code() {
    let mut config = EngineConfig::immediate();
    config.api_max_retries = 1;
    let h = Harness::with_config(PipelineSettings::default(), config);
    let (exec, _) = h.create_two_sample_execution();
    h.service.push_status(Err(api(404)));
    h.service.push_status(Err(api(404)));

    h.drain();
    let e = h.execution(exec.id);
    assert_eq!(e.state, ExecutionState::Error);
    assert_eq!(e.http_error_code, Some(404));
    assert_eq!(h.service.status_calls(), 2);
    assert!(e.cleaned);
}

#[test]
fn cancellation_retries_connectivity_then_confirms() {
    let h = Harness::new(PipelineSettings::default());
    let (exec, _) = h.create_two_sample_execution();
    h.step().expect("preparation");
    h.step().expect("submission");
    h.orchestrator.cancel(exec.id).unwrap();
    h.service.push_cancel(Err(ServiceError::Connectivity("timeout".into())));

    let (env, result) = h.step().expect("cancellation");
    assert_eq!(env.task, TaskKind::Cancellation);
    assert!(matches!(result, TaskResult::Retried { .. }));
    assert_eq!(h.execution(exec.id).state, ExecutionState::Canceling);

    h.drain();
    let e = h.execution(exec.id);
    assert_eq!(e.state, ExecutionState::Canceled);
    assert_eq!(h.service.cancels(), vec!["run-1".to_string()]);
    assert!(e.cleaned);
}
