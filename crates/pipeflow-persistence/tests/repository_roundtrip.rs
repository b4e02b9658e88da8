
use chrono::{Duration, Utc};
use indexmap::IndexMap;
use pipeflow_core::{ExecutionRepository, OrchestrationError};
use pipeflow_domain::{Attachable, AttachableKind, Attachment, AttachmentMetadata, BlobRef, Checkpoint, ExecutionEvent,
                      ExecutionState, Sample, SamplesWorkflowExecution, StateChange, Submitter, WorkflowExecution,
                      WorkflowRef};
use serde_json::json;
use uuid::Uuid;

fn execution_with_joins(n: usize) -> (WorkflowExecution, Vec<SamplesWorkflowExecution>) {
    let exec = WorkflowExecution::new(Submitter::user(Uuid::new_v4()),
                                      None,
                                      WorkflowRef::new("phac-nml/iridanextexample", "1.0.2"),
                                      Utc::now());
    let joins = (0..n).rev()
                      .map(|i| SamplesWorkflowExecution::new(exec.id, Uuid::new_v4(), format!("INXT_SAM_{i}"), i, IndexMap::new()))
                      .collect();
    (exec, joins)
}

#[test]
fn executions_and_joins_round_trip_in_position_order() {
    let Some(repo) = test_support::repository() else {
        eprintln!("skip (no DATABASE_URL)");
        return;
    };
    let (mut exec, joins) = execution_with_joins(4);
    repo.insert_execution(&exec, &joins).unwrap();
    assert!(repo.insert_execution(&exec, &[]).is_err(), "duplicate insert is rejected");

    let positions: Vec<usize> = repo.samples_workflow_executions(exec.id).unwrap().iter().map(|j| j.position).collect();
    assert_eq!(positions, vec![0, 1, 2, 3]);

    exec.state = pipeflow_domain::transition(exec.state, ExecutionEvent::Prepared).unwrap();
    exec.checkpoint = Some(Checkpoint::start("attach_global_outputs"));
    exec.workflow_params.insert("genome_size".into(), json!(5000000));
    repo.save_execution(&exec).unwrap();
    let back = repo.get_execution(exec.id).unwrap();
    assert_eq!(back, exec);

    let mut join = repo.samples_workflow_executions(exec.id).unwrap().remove(2);
    join.metadata.insert("qc.score".into(), json!(9));
    repo.save_samples_workflow_execution(&join).unwrap();
    assert_eq!(repo.samples_workflow_executions(exec.id).unwrap()[2].metadata["qc.score"], json!(9));

    assert!(matches!(repo.get_execution(Uuid::new_v4()), Err(OrchestrationError::NotFound(_))));
}

#[test]
fn state_change_log_is_append_only_and_ordered() {
    let Some(repo) = test_support::repository() else {
        eprintln!("skip (no DATABASE_URL)");
        return;
    };
    let (exec, joins) = execution_with_joins(1);
    repo.insert_execution(&exec, &joins).unwrap();
    let t0 = Utc::now();
    let path = [(ExecutionState::Initial, ExecutionState::Prepared),
                (ExecutionState::Prepared, ExecutionState::Submitted),
                (ExecutionState::Submitted, ExecutionState::Running)];
    for (i, (from, to)) in path.iter().enumerate() {
        repo.append_state_change(&StateChange { execution_id: exec.id,
                                                from: *from,
                                                to: *to,
                                                at: t0 + Duration::seconds(i as i64) })
            .unwrap();
    }
    let changes = repo.state_changes(exec.id).unwrap();
    let got: Vec<_> = changes.iter().map(|c| (c.from, c.to)).collect();
    assert_eq!(got, path.to_vec());
    assert_eq!(pipeflow_domain::entered_at(&changes, ExecutionState::Running).map(|t| t.timestamp()),
               Some((t0 + Duration::seconds(2)).timestamp()));
}

#[test]
fn samples_attachments_and_activities_persist() {
    let Some(repo) = test_support::repository() else {
        eprintln!("skip (no DATABASE_URL)");
        return;
    };
    let mut sample = Sample::new("INXT_SAM_AAAAAAAAAA", "sample A");
    repo.save_sample(&sample).unwrap();
    sample.metadata.insert("organism".into(), json!("Escherichia coli"));
    repo.save_sample(&sample).unwrap();
    assert_eq!(repo.get_sample(sample.id).unwrap(), sample);

    let owner = Attachable::new(AttachableKind::Sample, sample.id);
    let now = Utc::now();
    for (i, name) in ["b_R2.fastq.gz", "a_R1.fastq.gz"].iter().enumerate() {
        let blob = BlobRef { key: format!("blobs/{i}"),
                             filename: name.to_string(),
                             byte_size: 4,
                             checksum: "00".repeat(32) };
        repo.create_attachment(&Attachment::new(owner, blob, AttachmentMetadata::for_filename(name), now))
            .unwrap();
    }
    let names: Vec<String> = repo.attachments_for(owner).unwrap().into_iter().map(|a| a.blob.filename).collect();
    assert_eq!(names, vec!["a_R1.fastq.gz", "b_R2.fastq.gz"]);
    assert!(repo.get_attachment(Uuid::new_v4()).unwrap().is_none());
    assert!(repo.activities_for(sample.id).unwrap().is_empty());
}
