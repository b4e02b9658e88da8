//! Simulación end-to-end en tiempo virtual: muestras con lecturas, servicio
//! remoto guionado y outputs escritos cuando la ejecución llega a
//! `Submitted`.
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use indexmap::IndexMap;
use pipeflow_adapters::{JsonPipelineRegistry, LocalFsBlobStore};
use pipeflow_core::storage::output_key;
use pipeflow_core::{BlobStore, Clock, EngineConfig, ExecutionRepository, GlobalId, InMemoryBlobStore,
                    InMemoryExecutionRepository, InMemoryPipelineRegistry, InMemoryScheduler, ManualClock, NewExecution,
                    NewSample, OrchestrationError, Orchestrator, PipelineRegistry, Ports, RecordingNotifier,
                    RemoteRunState, RunStatus, ScriptedExecutionService, StageContext, TaskResult, Worker};
use pipeflow_domain::{Attachable, AttachableKind, Attachment, AttachmentMetadata, ExecutionState, PipelineDefinition,
                      PipelineSettings, RuntimeLimit, Sample, Submitter, WorkflowExecution, WorkflowRef};
use serde_json::{json, Value};
use uuid::Uuid;

const APP: &str = "pipeflow";
const MAX_TASKS: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Complete,
    Fail,
    Cancel,
    Timeout,
}

impl std::str::FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "complete" => Ok(Self::Complete),
            "fail" => Ok(Self::Fail),
            "cancel" => Ok(Self::Cancel),
            "timeout" => Ok(Self::Timeout),
            other => Err(format!("unknown outcome '{other}' (complete|fail|cancel|timeout)")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SimulationOptions {
    pub samples: usize,
    pub outcome: Outcome,
    pub storage: Option<PathBuf>,
    pub registry: Option<PathBuf>,
    pub max_runtime: Option<String>,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self { samples: 2,
               outcome: Outcome::Complete,
               storage: None,
               registry: None,
               max_runtime: None }
    }
}

#[derive(Debug)]
pub struct SimulationReport {
    pub execution: WorkflowExecution,
    pub path: Vec<(ExecutionState, ExecutionState)>,
    pub tasks: usize,
    pub harvested: usize,
    pub notified: usize,
}

impl SimulationReport {
    pub fn to_json(&self) -> Value {
        json!({
            "execution_id": self.execution.id,
            "state": self.execution.state,
            "run_id": self.execution.run_id,
            "http_error_code": self.execution.http_error_code,
            "cleaned": self.execution.cleaned,
            "path": self.path.iter().map(|(f, t)| format!("{f} -> {t}")).collect::<Vec<_>>(),
            "tasks": self.tasks,
            "harvested_attachments": self.harvested,
            "notifications": self.notified,
        })
    }
}

fn example_pipeline(max_runtime: Option<RuntimeLimit>) -> PipelineDefinition {
    PipelineDefinition { name: "phac-nml/iridanextexample".into(),
                         version: "1.0.2".into(),
                         url: "https://github.com/phac-nml/iridanextexample".into(),
                         samplesheet_headers: vec!["sample".into(), "fastq_1".into(), "fastq_2".into()],
                         parameters: IndexMap::new(),
                         settings: PipelineSettings { max_runtime,
                                                      ..PipelineSettings::default() },
                         engine: Default::default() }
}

fn parse_limit(raw: &str) -> RuntimeLimit {
    raw.trim()
       .parse::<u64>()
       .map(RuntimeLimit::Seconds)
       .unwrap_or_else(|_| RuntimeLimit::Formula(raw.to_string()))
}

fn gzip(bytes: &[u8]) -> Result<Vec<u8>, OrchestrationError> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(bytes).map_err(|e| OrchestrationError::Staging(e.to_string()))?;
    enc.finish().map_err(|e| OrchestrationError::Staging(e.to_string()))
}

struct Simulation {
    clock: Arc<ManualClock>,
    queue: Arc<InMemoryScheduler>,
    repo: Arc<InMemoryExecutionRepository>,
    blobs: Arc<dyn BlobStore>,
    service: Arc<ScriptedExecutionService>,
    notifier: Arc<RecordingNotifier>,
    worker: Worker,
    orchestrator: Orchestrator,
    pipeline: PipelineDefinition,
}

impl Simulation {
    fn new(opts: &SimulationOptions) -> Result<Self, OrchestrationError> {
        let limit = opts.max_runtime.as_deref().map(parse_limit);
        let (registry, pipeline): (Arc<dyn PipelineRegistry>, PipelineDefinition) = match &opts.registry {
            Some(path) => {
                let registry = JsonPipelineRegistry::from_path(path)?;
                let pipeline = registry.workflows()
                                       .next()
                                       .and_then(|w| registry.find(w))
                                       .ok_or_else(|| OrchestrationError::Config("registry declares no pipelines".into()))?;
                (Arc::new(registry), pipeline)
            }
            None => {
                let registry = InMemoryPipelineRegistry::new();
                let pipeline = example_pipeline(limit);
                registry.register(pipeline.clone());
                (Arc::new(registry), pipeline)
            }
        };
        let mut config = EngineConfig::from_env();
        config.preparation_delay = std::time::Duration::ZERO;
        let blobs: Arc<dyn BlobStore> = match &opts.storage {
            Some(root) => Arc::new(LocalFsBlobStore::new(root)?),
            None => Arc::new(InMemoryBlobStore::new(config.storage.clone())),
        };

        let clock = Arc::new(ManualClock::new(Utc::now()));
        let queue = Arc::new(InMemoryScheduler::new(clock.clone()));
        let repo = Arc::new(InMemoryExecutionRepository::new());
        let service = Arc::new(ScriptedExecutionService::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let ports = Ports { repository: repo.clone(),
                            blobs: blobs.clone(),
                            execution_service: service.clone(),
                            registry,
                            scheduler: queue.clone(),
                            clock: clock.clone(),
                            notifier: notifier.clone() };
        let ctx = StageContext::new(ports, config);
        Ok(Self { clock,
                  queue,
                  repo,
                  blobs,
                  service,
                  notifier,
                  worker: Worker::new(ctx.clone()),
                  orchestrator: Orchestrator::new(ctx),
                  pipeline })
    }

    fn seed_sample(&self, index: usize) -> Result<NewSample, OrchestrationError> {
        let sample = Sample::new(format!("INXT_SAM_{index:010}"), format!("simulated sample {index}"));
        self.repo.save_sample(&sample)?;
        let mut reads = Vec::new();
        for direction in ["R1", "R2"] {
            let filename = format!("{}_{direction}.fastq.gz", sample.puid);
            let blob = self.blobs.put(&gzip(format!("@{filename}\nACGT\n+\nIIII\n").as_bytes())?, &filename)?;
            let attachment = Attachment::new(Attachable::new(AttachableKind::Sample, sample.id),
                                             blob,
                                             AttachmentMetadata::for_filename(&filename),
                                             self.clock.now());
            self.repo.create_attachment(&attachment)?;
            reads.push(GlobalId::attachment(APP, attachment.id).to_string());
        }
        let params = self.pipeline
                         .samplesheet_headers
                         .iter()
                         .map(|h| {
                             let value = match h.as_str() {
                                 "sample" => sample.puid.clone(),
                                 "fastq_1" => reads[0].clone(),
                                 "fastq_2" => reads[1].clone(),
                                 _ => String::new(),
                             };
                             (h.clone(), value)
                         })
                         .collect();
        Ok(NewSample { sample_id: sample.id,
                       sample_puid: sample.puid,
                       samplesheet_params: params })
    }

    fn write_outputs(&self, execution: &WorkflowExecution, puids: &[String]) -> Result<(), OrchestrationError> {
        let Some(run_dir) = execution.blob_run_directory.as_deref() else {
            return Ok(());
        };
        let mut files = serde_json::Map::new();
        let mut metadata = serde_json::Map::new();
        for (i, puid) in puids.iter().enumerate() {
            let path = format!("assembly/{puid}.assembly.fa.gz");
            self.blobs.put_with_key(&output_key(run_dir, &path),
                                    &gzip(format!(">{puid}\nACGT\n").as_bytes())?,
                                    &format!("{puid}.assembly.fa.gz"))?;
            files.insert(puid.clone(), json!([{ "path": path }]));
            metadata.insert(puid.clone(), json!({"qc": {"reads": 1000 * (i + 1), "status": "PASS"}}));
        }
        self.blobs.put_with_key(&output_key(run_dir, "summary/summary.txt.gz"),
                                &gzip(b"all samples assembled\n")?,
                                "summary.txt.gz")?;
        let manifest = json!({
            "files": {"global": [{"path": "summary/summary.txt.gz"}], "samples": files},
            "metadata": {"samples": metadata}
        });
        self.blobs.put_with_key(&output_key(run_dir, "iridanext.output.json.gz"),
                                &gzip(manifest.to_string().as_bytes())?,
                                "iridanext.output.json.gz")?;
        Ok(())
    }

    fn script_remote(&self, outcome: Outcome) {
        self.service.push_status(Ok(RunStatus::new(RemoteRunState::Queued)));
        self.service.push_status(Ok(RunStatus::new(RemoteRunState::Running)));
        match outcome {
            Outcome::Complete => self.service.push_status(Ok(RunStatus::new(RemoteRunState::Complete))),
            Outcome::Fail => self.service.push_status(Ok(RunStatus::new(RemoteRunState::SystemError))),
            Outcome::Cancel | Outcome::Timeout => {}
        }
    }
}

/// Corre una ejecución completa en tiempo virtual.
pub fn run(opts: &SimulationOptions) -> Result<SimulationReport, OrchestrationError> {
    if opts.samples == 0 {
        return Err(OrchestrationError::Validation("at least one sample is required".into()));
    }
    if opts.outcome == Outcome::Timeout && opts.max_runtime.is_none() && opts.registry.is_none() {
        return Err(OrchestrationError::Validation("timeout outcome needs --max-runtime".into()));
    }
    let sim = Simulation::new(opts)?;
    let samples = (0..opts.samples).map(|i| sim.seed_sample(i)).collect::<Result<Vec<_>, _>>()?;
    let puids: Vec<String> = samples.iter().map(|s| s.sample_puid.clone()).collect();
    sim.script_remote(opts.outcome);

    let request = NewExecution { name: Some("simulated run".into()),
                                 submitter: Submitter::user(Uuid::new_v4()),
                                 namespace: None,
                                 workflow: WorkflowRef::new(sim.pipeline.name.clone(), sim.pipeline.version.clone()),
                                 workflow_params: IndexMap::new(),
                                 samples,
                                 email_notification: true,
                                 update_samples: true };
    let execution = sim.orchestrator.create_execution(request)?;
    let id = execution.id;
    log::info!("simulation started execution_id={id} samples={} outcome={:?}", opts.samples, opts.outcome);

    let mut tasks = 0;
    let mut outputs_written = false;
    let mut cancel_sent = false;
    while tasks < MAX_TASKS {
        let Some((envelope, result)) = sim.worker.drain(&sim.queue, &sim.clock, 1).pop() else {
            break;
        };
        tasks += 1;
        if let TaskResult::Failed(reason) | TaskResult::Dropped(reason) = &result {
            log::warn!("task={} result={reason}", envelope.task.as_str());
        }
        let current = sim.repo.get_execution(id)?;
        if !outputs_written && current.state == ExecutionState::Submitted {
            sim.write_outputs(&current, &puids)?;
            outputs_written = true;
        }
        if opts.outcome == Outcome::Cancel && !cancel_sent && current.state == ExecutionState::Running {
            sim.orchestrator.cancel(id)?;
            cancel_sent = true;
        }
    }

    let execution = sim.repo.get_execution(id)?;
    let path = sim.repo.state_changes(id)?.iter().map(|c| (c.from, c.to)).collect();
    let mut harvested = sim.repo
                           .attachments_for(Attachable::new(AttachableKind::WorkflowExecution, id))?
                           .len();
    for join in sim.repo.samples_workflow_executions(id)? {
        harvested += join.outputs.len();
    }
    Ok(SimulationReport { execution,
                          path,
                          tasks,
                          harvested,
                          notified: sim.notifier.sent().len() })
}
