#![allow(dead_code)]
use std::io::Write;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use indexmap::IndexMap;
use pipeflow_core::{BlobStore, Clock, EngineConfig, ExecutionRepository, GlobalId, InMemoryBlobStore,
                    InMemoryExecutionRepository, InMemoryPipelineRegistry, InMemoryScheduler, ManualClock, NewExecution,
                    NewSample, Orchestrator, Ports, RecordingNotifier, ScriptedExecutionService, StageContext,
                    StorageBackend, TaskEnvelope, TaskResult, Worker};
use pipeflow_domain::{Attachable, AttachableKind, Attachment, AttachmentMetadata, PipelineDefinition, PipelineSettings,
                      Sample, Submitter, WorkflowExecution, WorkflowRef};
use serde_json::{json, Value};
use uuid::Uuid;

pub const PIPELINE: &str = "phac-nml/iridanextexample";
pub const VERSION: &str = "1.0.2";

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub queue: Arc<InMemoryScheduler>,
    pub repo: Arc<InMemoryExecutionRepository>,
    pub blobs: Arc<InMemoryBlobStore>,
    pub service: Arc<ScriptedExecutionService>,
    pub registry: Arc<InMemoryPipelineRegistry>,
    pub notifier: Arc<RecordingNotifier>,
    pub worker: Worker,
    pub orchestrator: Orchestrator,
}

pub fn pipeline(settings: PipelineSettings) -> PipelineDefinition {
    let mut def: PipelineDefinition = serde_json::from_value(json!({
        "name": PIPELINE,
        "version": VERSION,
        "url": "https://github.com/phac-nml/iridanextexample",
        "samplesheet_headers": ["sample", "fastq_1", "fastq_2"],
        "parameters": {
            "assembler": {"type": "string", "default": "stub"},
            "genome_size": {"type": "integer"}
        }
    }))
    .expect("pipeline json");
    def.settings = settings;
    def
}

impl Harness {
    pub fn new(settings: PipelineSettings) -> Self {
        Self::with_config(settings, EngineConfig::immediate())
    }

    pub fn with_config(settings: PipelineSettings, mut config: EngineConfig) -> Self {
        config.storage = StorageBackend::S3 { bucket: "pipeflow-test".into() };
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()));
        let queue = Arc::new(InMemoryScheduler::new(clock.clone()));
        let repo = Arc::new(InMemoryExecutionRepository::new());
        let blobs = Arc::new(InMemoryBlobStore::new(config.storage.clone()));
        let service = Arc::new(ScriptedExecutionService::new());
        let registry = Arc::new(InMemoryPipelineRegistry::new());
        let notifier = Arc::new(RecordingNotifier::default());
        registry.register(pipeline(settings));

        let ports = Ports { repository: repo.clone(),
                            blobs: blobs.clone(),
                            execution_service: service.clone(),
                            registry: registry.clone(),
                            scheduler: queue.clone(),
                            clock: clock.clone(),
                            notifier: notifier.clone() };
        let ctx = StageContext::new(ports, config);
        Self { clock,
               queue,
               repo,
               blobs,
               service,
               registry,
               notifier,
               worker: Worker::new(ctx.clone()),
               orchestrator: Orchestrator::new(ctx) }
    }

    /// Muestra con un par de lecturas adjuntas; devuelve la muestra y las
    /// referencias globales de cada archivo.
    pub fn sample_with_reads(&self, puid: &str) -> (Sample, String, String) {
        let sample = Sample::new(puid, format!("sample {puid}"));
        self.repo.save_sample(&sample).unwrap();
        let mut gids = Vec::new();
        for (name, direction) in [(format!("{puid}_R1.fastq.gz"), "forward"), (format!("{puid}_R2.fastq.gz"), "reverse")] {
            let blob = self.blobs.put(format!("@{name}\nACGT\n+\nIIII\n").as_bytes(), &name).unwrap();
            let mut metadata = AttachmentMetadata::for_filename(&name);
            metadata.direction = Some(direction.to_string());
            let attachment = Attachment::new(Attachable::new(AttachableKind::Sample, sample.id), blob, metadata, self.clock.now());
            self.repo.create_attachment(&attachment).unwrap();
            gids.push(GlobalId::attachment("pipeflow", attachment.id).to_string());
        }
        let r2 = gids.pop().unwrap();
        let r1 = gids.pop().unwrap();
        (sample, r1, r2)
    }

    pub fn request(&self, submitter: Submitter, samples: &[(Sample, String, String)]) -> NewExecution {
        let samples = samples.iter()
                             .map(|(s, r1, r2)| {
                                 let mut params = IndexMap::new();
                                 params.insert("sample".to_string(), s.puid.clone());
                                 params.insert("fastq_1".to_string(), r1.clone());
                                 params.insert("fastq_2".to_string(), r2.clone());
                                 NewSample { sample_id: s.id,
                                             sample_puid: s.puid.clone(),
                                             samplesheet_params: params }
                             })
                             .collect();
        let mut workflow_params = IndexMap::new();
        workflow_params.insert("genome_size".to_string(), json!("5000000"));
        NewExecution { name: Some("test run".into()),
                       submitter,
                       namespace: None,
                       workflow: WorkflowRef::new(PIPELINE, VERSION),
                       workflow_params,
                       samples,
                       email_notification: true,
                       update_samples: true }
    }

    /// Ejecución con dos muestras creada y con Preparation encolada.
    pub fn create_two_sample_execution(&self) -> (WorkflowExecution, Vec<Sample>) {
        let a = self.sample_with_reads("INXT_SAM_AAAAAAAAAA");
        let b = self.sample_with_reads("INXT_SAM_BBBBBBBBBB");
        let samples = vec![a.0.clone(), b.0.clone()];
        let exec = self.orchestrator
                       .create_execution(self.request(Submitter::user(Uuid::new_v4()), &[a, b]))
                       .expect("create execution");
        (exec, samples)
    }

    pub fn execution(&self, id: Uuid) -> WorkflowExecution {
        self.repo.get_execution(id).expect("execution")
    }

    /// Corre la próxima tarea (adelantando el reloj si hace falta).
    pub fn step(&self) -> Option<(TaskEnvelope, TaskResult)> {
        self.worker.drain(&self.queue, &self.clock, 1).pop()
    }

    pub fn drain(&self) -> Vec<(TaskEnvelope, TaskResult)> {
        self.worker.drain(&self.queue, &self.clock, 500)
    }

    /// Escribe el manifest gzip y los archivos que referencia bajo
    /// `{run_dir}/output/`.
    pub fn write_outputs(&self, execution_id: Uuid, manifest: &Value, files: &[&str]) {
        let run_dir = self.execution(execution_id).blob_run_directory.expect("run dir");
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(manifest.to_string().as_bytes()).unwrap();
        let gz = enc.finish().unwrap();
        self.blobs
            .put_with_key(&format!("{run_dir}/output/iridanext.output.json.gz"), &gz, "iridanext.output.json.gz")
            .unwrap();
        for f in files {
            self.write_output_file(&run_dir, f);
        }
    }

    pub fn write_output_file(&self, run_dir: &str, path: &str) {
        let key = format!("{run_dir}/output/{}", path.trim_start_matches('/'));
        let name = path.rsplit('/').next().unwrap_or(path);
        self.blobs.put_with_key(&key, format!("content of {path}").as_bytes(), name).unwrap();
    }
}

pub fn two_sample_manifest() -> Value {
    json!({
        "files": {
            "global": [{"path": "summary/summary.txt.gz"}],
            "samples": {
                "INXT_SAM_AAAAAAAAAA": [{"path": "assembly/INXT_SAM_AAAAAAAAAA.assembly.fa.gz"}],
                "INXT_SAM_BBBBBBBBBB": [{"path": "assembly/INXT_SAM_BBBBBBBBBB.assembly.fa.gz"}],
                "INXT_SAM_ZZZZZZZZZZ": [{"path": "assembly/unknown.fa.gz"}]
            }
        },
        "metadata": {
            "samples": {
                "INXT_SAM_AAAAAAAAAA": {"qc": {"score": 9}, "organism": "Escherichia coli"},
                "INXT_SAM_BBBBBBBBBB": {"qc": {"score": 7}}
            }
        }
    })
}

pub const TWO_SAMPLE_FILES: &[&str] = &["summary/summary.txt.gz",
                                        "assembly/INXT_SAM_AAAAAAAAAA.assembly.fa.gz",
                                        "assembly/INXT_SAM_BBBBBBBBBB.assembly.fa.gz"];
