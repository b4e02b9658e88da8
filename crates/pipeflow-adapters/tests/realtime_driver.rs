use std::fs;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use indexmap::IndexMap;
use pipeflow_adapters::{JsonPipelineRegistry, LocalFsBlobStore, RealtimeDriver};
use pipeflow_core::{BlobStore, EngineConfig, ExecutionRepository, GlobalId, InMemoryExecutionRepository,
                    InMemoryScheduler, ManualClock, NewExecution, NewSample, Orchestrator, Ports, RecordingNotifier,
                    RemoteRunState, RunStatus, ScriptedExecutionService, StageContext, Worker};
use pipeflow_domain::{Attachable, AttachableKind, Attachment, AttachmentMetadata, ExecutionState, Sample, Submitter,
                      WorkflowRef};
use serde_json::json;
use uuid::Uuid;

const REGISTRY: &str = r#"[{"name": "phac-nml/iridanextexample", "version": "1.0.2",
    "url": "https://github.com/phac-nml/iridanextexample",
    "samplesheet_headers": ["sample", "fastq_1"]}]"#;

struct Fixture {
    root: std::path::PathBuf,
    clock: Arc<ManualClock>,
    queue: Arc<InMemoryScheduler>,
    repo: Arc<InMemoryExecutionRepository>,
    blobs: Arc<LocalFsBlobStore>,
    service: Arc<ScriptedExecutionService>,
    orchestrator: Orchestrator,
    driver: RealtimeDriver,
}

fn fixture(tag: &str) -> Fixture {
    let root = std::env::temp_dir().join(format!("pipeflow-driver-{tag}-{}", Uuid::new_v4()));
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let queue = Arc::new(InMemoryScheduler::new(clock.clone()));
    let repo = Arc::new(InMemoryExecutionRepository::new());
    let blobs = Arc::new(LocalFsBlobStore::new(&root).expect("blob root"));
    let service = Arc::new(ScriptedExecutionService::new());
    let registry = Arc::new(JsonPipelineRegistry::from_json(REGISTRY).expect("registry"));
    let ports = Ports { repository: repo.clone(),
                        blobs: blobs.clone(),
                        execution_service: service.clone(),
                        registry,
                        scheduler: queue.clone(),
                        clock: clock.clone(),
                        notifier: Arc::new(RecordingNotifier::default()) };
    let ctx = StageContext::new(ports, EngineConfig::immediate());
    let driver = RealtimeDriver::new(Arc::new(Worker::new(ctx.clone())),
                                     queue.clone(),
                                     clock.clone(),
                                     Duration::from_millis(5));
    Fixture { root,
              clock,
              queue,
              repo,
              blobs,
              service,
              orchestrator: Orchestrator::new(ctx),
              driver }
}

fn create_execution(f: &Fixture) -> Uuid {
    let sample = Sample::new("INXT_SAM_AAAAAAAAAA", "sample A");
    f.repo.save_sample(&sample).unwrap();
    let blob = f.blobs.put(b"@r\nACGT\n+\nIIII\n", "a_R1.fastq").unwrap();
    let attachment = Attachment::new(Attachable::new(AttachableKind::Sample, sample.id),
                                     blob,
                                     AttachmentMetadata::for_filename("a_R1.fastq"),
                                     Utc::now());
    f.repo.create_attachment(&attachment).unwrap();

    let mut params = IndexMap::new();
    params.insert("sample".to_string(), sample.puid.clone());
    params.insert("fastq_1".to_string(), GlobalId::attachment("pipeflow", attachment.id).to_string());
    let request = NewExecution { name: None,
                                 submitter: Submitter::user(Uuid::new_v4()),
                                 namespace: None,
                                 workflow: WorkflowRef::new("phac-nml/iridanextexample", "1.0.2"),
                                 workflow_params: IndexMap::new(),
                                 samples: vec![NewSample { sample_id: sample.id,
                                                           sample_puid: sample.puid.clone(),
                                                           samplesheet_params: params }],
                                 email_notification: false,
                                 update_samples: false };
    f.orchestrator.create_execution(request).unwrap().id
}

#[test]
fn driver_runs_due_tasks_against_the_local_store() {
    let f = fixture("flow");
    let id = create_execution(&f);

    let stats = tokio_test::block_on(f.driver.run_until_idle(3));
    assert_eq!(stats.tasks, 2);
    assert_eq!(stats.failures, 0);
    let exec = f.repo.get_execution(id).unwrap();
    assert_eq!(exec.state, ExecutionState::Submitted);
    let run_dir = exec.blob_run_directory.clone().unwrap();
    let samplesheet = String::from_utf8(f.blobs.get(&format!("{run_dir}/samplesheet.csv")).unwrap()).unwrap();
    assert!(samplesheet.contains(&f.root.to_string_lossy().into_owned()));
    assert_eq!(exec.workflow_params["outdir"],
               json!(f.root.join(format!("{run_dir}/output/")).to_string_lossy()));

    f.service.push_status(Ok(RunStatus::new(RemoteRunState::Canceled)));
    f.clock.advance(Duration::from_secs(30));
    let stats = tokio_test::block_on(f.driver.run_until_idle(10));
    assert!(stats.ticks < 10, "queue drained early");
    let exec = f.repo.get_execution(id).unwrap();
    assert_eq!(exec.state, ExecutionState::Canceled);
    assert!(exec.cleaned);
    assert!(f.blobs.keys_with_prefix(&format!("{run_dir}/")).unwrap().is_empty());
    assert!(f.queue.is_empty());
    let _ = fs::remove_dir_all(&f.root);
}

#[test]
fn driver_stops_on_shutdown_signal() {
    let f = fixture("shutdown");
    let (tx, rx) = tokio::sync::watch::channel(false);
    let stats = tokio_test::block_on(async {
        let stopper = async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            let _ = tx.send(true);
        };
        let (stats, _) = tokio::join!(f.driver.run(rx), stopper);
        stats
    });
    assert!(stats.ticks >= 1);
    assert_eq!(stats.tasks, 0);
    let _ = fs::remove_dir_all(&f.root);
}
