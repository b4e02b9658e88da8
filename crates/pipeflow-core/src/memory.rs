//! Implementaciones en memoria de los puertos.
//!
//! Misma semántica que los adaptadores reales (orden por `position`, claves
//! content-addressed, `delete_prefix` idempotente); se usan en tests, en la
//! simulación de la CLI y como referencia del contrato.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use dashmap::DashMap;
use pipeflow_domain::{Activity, Attachable, Attachment, BlobRef, ExecutionState, PipelineDefinition, Sample,
                      SamplesWorkflowExecution, StateChange, WorkflowExecution, WorkflowRef};
use uuid::Uuid;

use crate::errors::{OrchestrationError, ServiceError};
use crate::ports::{BlobStore, ExecutionRepository, ExecutionServiceClient, Notifier, PipelineRegistry, RemoteRunState,
                   RunRequest, RunStatus};
use crate::storage::{checksum, content_key, StorageBackend};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

// ---------------------------------------------------------------------------
// Repositorio
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryExecutionRepository {
    executions: DashMap<Uuid, WorkflowExecution>,
    changes: DashMap<Uuid, Vec<StateChange>>,
    joins: DashMap<Uuid, SamplesWorkflowExecution>,
    samples: DashMap<Uuid, Sample>,
    attachments: DashMap<Uuid, Attachment>,
    activities: DashMap<Uuid, Vec<Activity>>,
}

impl InMemoryExecutionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn execution_count(&self) -> usize {
        self.executions.len()
    }
}

impl ExecutionRepository for InMemoryExecutionRepository {
    fn insert_execution(&self,
                        execution: &WorkflowExecution,
                        samples: &[SamplesWorkflowExecution])
                        -> Result<(), OrchestrationError> {
        if self.executions.contains_key(&execution.id) {
            return Err(OrchestrationError::Repository(format!("execution {} already exists", execution.id)));
        }
        self.executions.insert(execution.id, execution.clone());
        for swe in samples {
            self.joins.insert(swe.id, swe.clone());
        }
        Ok(())
    }

    fn get_execution(&self, id: Uuid) -> Result<WorkflowExecution, OrchestrationError> {
        self.executions
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or_else(|| OrchestrationError::NotFound(format!("workflow execution {id}")))
    }

    fn save_execution(&self, execution: &WorkflowExecution) -> Result<(), OrchestrationError> {
        self.executions.insert(execution.id, execution.clone());
        Ok(())
    }

    fn save_execution_if(&self, execution: &WorkflowExecution, expected: ExecutionState) -> Result<bool, OrchestrationError> {
        let Some(mut current) = self.executions.get_mut(&execution.id) else {
            return Err(OrchestrationError::NotFound(format!("workflow execution {}", execution.id)));
        };
        if current.state != expected {
            return Ok(false);
        }
        *current = execution.clone();
        Ok(true)
    }

    fn append_state_change(&self, change: &StateChange) -> Result<(), OrchestrationError> {
        self.changes.entry(change.execution_id).or_default().push(change.clone());
        Ok(())
    }

    fn state_changes(&self, execution_id: Uuid) -> Result<Vec<StateChange>, OrchestrationError> {
        Ok(self.changes.get(&execution_id).map(|c| c.value().clone()).unwrap_or_default())
    }

    fn samples_workflow_executions(&self, execution_id: Uuid) -> Result<Vec<SamplesWorkflowExecution>, OrchestrationError> {
        let mut out: Vec<SamplesWorkflowExecution> = self.joins
                                                         .iter()
                                                         .filter(|e| e.workflow_execution_id == execution_id)
                                                         .map(|e| e.value().clone())
                                                         .collect();
        out.sort_by_key(|s| s.position);
        Ok(out)
    }

    fn save_samples_workflow_execution(&self, swe: &SamplesWorkflowExecution) -> Result<(), OrchestrationError> {
        self.joins.insert(swe.id, swe.clone());
        Ok(())
    }

    fn get_sample(&self, id: Uuid) -> Result<Sample, OrchestrationError> {
        self.samples
            .get(&id)
            .map(|s| s.value().clone())
            .ok_or_else(|| OrchestrationError::NotFound(format!("sample {id}")))
    }

    fn save_sample(&self, sample: &Sample) -> Result<(), OrchestrationError> {
        self.samples.insert(sample.id, sample.clone());
        Ok(())
    }

    fn get_attachment(&self, id: Uuid) -> Result<Option<Attachment>, OrchestrationError> {
        Ok(self.attachments.get(&id).map(|a| a.value().clone()))
    }

    fn create_attachment(&self, attachment: &Attachment) -> Result<(), OrchestrationError> {
        self.attachments.insert(attachment.id, attachment.clone());
        Ok(())
    }

    fn attachments_for(&self, attachable: Attachable) -> Result<Vec<Attachment>, OrchestrationError> {
        let mut out: Vec<Attachment> = self.attachments
                                           .iter()
                                           .filter(|a| a.attachable == attachable)
                                           .map(|a| a.value().clone())
                                           .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.blob.filename.cmp(&b.blob.filename)));
        Ok(out)
    }

    fn create_activity(&self, activity: &Activity) -> Result<(), OrchestrationError> {
        self.activities.entry(activity.trackable_id).or_default().push(activity.clone());
        Ok(())
    }

    fn activities_for(&self, trackable_id: Uuid) -> Result<Vec<Activity>, OrchestrationError> {
        Ok(self.activities.get(&trackable_id).map(|a| a.value().clone()).unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// Blob store
// ---------------------------------------------------------------------------

pub struct InMemoryBlobStore {
    backend: StorageBackend,
    blobs: DashMap<String, (BlobRef, Vec<u8>)>,
    copies: AtomicUsize,
}

impl InMemoryBlobStore {
    pub fn new(backend: StorageBackend) -> Self {
        Self { backend,
               blobs: DashMap::new(),
               copies: AtomicUsize::new(0) }
    }

    /// Claves ordenadas bajo `prefix`.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self.blobs
                                        .iter()
                                        .filter(|e| e.key().starts_with(prefix))
                                        .map(|e| e.key().clone())
                                        .collect();
        keys.sort();
        keys
    }

    /// Cantidad de `copy_with_key` ejecutados desde la creación.
    pub fn copy_count(&self) -> usize {
        self.copies.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    fn store(&self, key: &str, bytes: &[u8], filename: &str) -> BlobRef {
        let blob = BlobRef { key: key.to_string(),
                             filename: filename.to_string(),
                             byte_size: bytes.len() as u64,
                             checksum: checksum(bytes) };
        self.blobs.insert(key.to_string(), (blob.clone(), bytes.to_vec()));
        blob
    }
}

impl Default for InMemoryBlobStore {
    fn default() -> Self {
        Self::new(StorageBackend::default())
    }
}

impl BlobStore for InMemoryBlobStore {
    fn put(&self, bytes: &[u8], filename: &str) -> Result<BlobRef, OrchestrationError> {
        Ok(self.store(&content_key(bytes), bytes, filename))
    }

    fn put_with_key(&self, key: &str, bytes: &[u8], filename: &str) -> Result<BlobRef, OrchestrationError> {
        Ok(self.store(key, bytes, filename))
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, OrchestrationError> {
        self.blobs
            .get(key)
            .map(|e| e.value().1.clone())
            .ok_or_else(|| OrchestrationError::NotFound(format!("blob {key}")))
    }

    fn exists(&self, key: &str) -> Result<bool, OrchestrationError> {
        Ok(self.blobs.contains_key(key))
    }

    fn copy_with_key(&self, source_key: &str, new_key: &str) -> Result<BlobRef, OrchestrationError> {
        let (src, bytes) = self.blobs
                               .get(source_key)
                               .map(|e| e.value().clone())
                               .ok_or_else(|| OrchestrationError::NotFound(format!("blob {source_key}")))?;
        self.copies.fetch_add(1, Ordering::SeqCst);
        Ok(self.store(new_key, &bytes, &src.filename))
    }

    fn resolve_uri(&self, key: &str) -> String {
        self.backend.render_uri(key)
    }

    fn delete_prefix(&self, prefix: &str) -> Result<usize, OrchestrationError> {
        let keys = self.keys_with_prefix(prefix);
        for k in &keys {
            self.blobs.remove(k);
        }
        Ok(keys.len())
    }
}

// ---------------------------------------------------------------------------
// Registry, notifier
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryPipelineRegistry {
    pipelines: DashMap<WorkflowRef, PipelineDefinition>,
}

impl InMemoryPipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, definition: PipelineDefinition) {
        self.pipelines.insert(definition.workflow_ref(), definition);
    }
}

impl PipelineRegistry for InMemoryPipelineRegistry {
    fn find(&self, workflow: &WorkflowRef) -> Option<PipelineDefinition> {
        self.pipelines.get(workflow).map(|p| p.value().clone())
    }
}

/// Notifier que sólo registra a quién se habría avisado.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(Uuid, ExecutionState)>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<(Uuid, ExecutionState)> {
        lock(&self.sent).clone()
    }
}

impl Notifier for RecordingNotifier {
    fn execution_finished(&self, execution: &WorkflowExecution) -> Result<(), OrchestrationError> {
        log::info!("notify execution_id={} state={}", execution.id, execution.state);
        lock(&self.sent).push((execution.id, execution.state));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Servicio remoto guionado
// ---------------------------------------------------------------------------

/// Servicio remoto cuyas respuestas se encolan de antemano.
///
/// Con la cola vacía: `submit` genera `run-<n>`, `get_status` devuelve el
/// estado de reserva (por defecto `RUNNING`) y `cancel` acepta.
pub struct ScriptedExecutionService {
    submit_script: Mutex<VecDeque<Result<String, ServiceError>>>,
    status_script: Mutex<VecDeque<Result<RunStatus, ServiceError>>>,
    cancel_script: Mutex<VecDeque<Result<(), ServiceError>>>,
    fallback_status: Mutex<RunStatus>,
    submissions: Mutex<Vec<RunRequest>>,
    submit_calls: AtomicUsize,
    status_calls: AtomicUsize,
    cancels: Mutex<Vec<String>>,
}

impl Default for ScriptedExecutionService {
    fn default() -> Self {
        Self { submit_script: Mutex::new(VecDeque::new()),
               status_script: Mutex::new(VecDeque::new()),
               cancel_script: Mutex::new(VecDeque::new()),
               fallback_status: Mutex::new(RunStatus::new(RemoteRunState::Running)),
               submissions: Mutex::new(Vec::new()),
               submit_calls: AtomicUsize::new(0),
               status_calls: AtomicUsize::new(0),
               cancels: Mutex::new(Vec::new()) }
    }
}

impl ScriptedExecutionService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_submit(&self, r: Result<String, ServiceError>) {
        lock(&self.submit_script).push_back(r);
    }

    pub fn push_status(&self, r: Result<RunStatus, ServiceError>) {
        lock(&self.status_script).push_back(r);
    }

    pub fn push_cancel(&self, r: Result<(), ServiceError>) {
        lock(&self.cancel_script).push_back(r);
    }

    pub fn set_fallback_status(&self, status: RunStatus) {
        *lock(&self.fallback_status) = status;
    }

    pub fn submissions(&self) -> Vec<RunRequest> {
        lock(&self.submissions).clone()
    }

    pub fn submit_calls(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn cancels(&self) -> Vec<String> {
        lock(&self.cancels).clone()
    }
}

impl ExecutionServiceClient for ScriptedExecutionService {
    fn submit(&self, request: &RunRequest) -> Result<String, ServiceError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        let scripted = lock(&self.submit_script).pop_front();
        let result = match scripted {
            Some(r) => r,
            None => Ok(format!("run-{}", lock(&self.submissions).len() + 1)),
        };
        if result.is_ok() {
            lock(&self.submissions).push(request.clone());
        }
        result
    }

    fn get_status(&self, _run_id: &str) -> Result<RunStatus, ServiceError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let scripted = lock(&self.status_script).pop_front();
        match scripted {
            Some(r) => r,
            None => Ok(lock(&self.fallback_status).clone()),
        }
    }

    fn cancel(&self, run_id: &str) -> Result<(), ServiceError> {
        let scripted = lock(&self.cancel_script).pop_front();
        let result = scripted.unwrap_or(Ok(()));
        if result.is_ok() {
            lock(&self.cancels).push(run_id.to_string());
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use indexmap::IndexMap;
    use pipeflow_domain::Submitter;

    #[test]
    fn join_records_come_back_ordered_by_position() {
        let repo = InMemoryExecutionRepository::new();
        let exec = WorkflowExecution::new(Submitter::user(Uuid::new_v4()),
                                          None,
                                          WorkflowRef::new("p", "1"),
                                          Utc::now());
        let joins: Vec<_> = (0..5).rev()
                                  .map(|i| SamplesWorkflowExecution::new(exec.id, Uuid::new_v4(), format!("S{i}"), i, IndexMap::new()))
                                  .collect();
        repo.insert_execution(&exec, &joins).unwrap();
        let positions: Vec<usize> = repo.samples_workflow_executions(exec.id).unwrap().iter().map(|j| j.position).collect();
        assert_eq!(positions, vec![0, 1, 2, 3, 4]);
        assert!(repo.insert_execution(&exec, &[]).is_err());
    }

    #[test]
    fn conditional_save_refuses_a_moved_state() {
        let repo = InMemoryExecutionRepository::new();
        let mut exec = WorkflowExecution::new(Submitter::user(Uuid::new_v4()),
                                              None,
                                              WorkflowRef::new("p", "1"),
                                              Utc::now());
        repo.insert_execution(&exec, &[]).unwrap();
        let mut stale = exec.clone();

        exec.state = ExecutionState::Canceling;
        assert!(repo.save_execution_if(&exec, ExecutionState::Initial).unwrap());

        stale.state = ExecutionState::Prepared;
        assert!(!repo.save_execution_if(&stale, ExecutionState::Initial).unwrap());
        assert_eq!(repo.get_execution(exec.id).unwrap().state, ExecutionState::Canceling);

        let missing = WorkflowExecution::new(Submitter::user(Uuid::new_v4()), None, WorkflowRef::new("p", "1"), Utc::now());
        assert!(matches!(repo.save_execution_if(&missing, ExecutionState::Initial),
                         Err(OrchestrationError::NotFound(_))));
    }

    #[test]
    fn blob_store_copies_and_deletes_by_prefix() {
        let store = InMemoryBlobStore::new(StorageBackend::S3 { bucket: "b".into() });
        let src = store.put(b"ACGT", "reads.fastq").unwrap();
        assert!(src.key.starts_with("blobs/"));
        store.copy_with_key(&src.key, "runs/x/input/a.fastq").unwrap();
        store.put_with_key("runs/x/samplesheet.csv", b"sample\n", "samplesheet.csv").unwrap();
        assert_eq!(store.copy_count(), 1);
        assert_eq!(store.resolve_uri("runs/x/samplesheet.csv"), "s3://b/runs/x/samplesheet.csv");
        assert_eq!(store.delete_prefix("runs/x/").unwrap(), 2);
        assert_eq!(store.delete_prefix("runs/x/").unwrap(), 0);
        assert!(store.exists(&src.key).unwrap());
        assert!(matches!(store.copy_with_key("missing", "k"), Err(OrchestrationError::NotFound(_))));
    }

    #[test]
    fn scripted_service_falls_back_when_script_runs_out() {
        let svc = ScriptedExecutionService::new();
        svc.push_status(Err(ServiceError::Connectivity("down".into())));
        assert!(svc.get_status("r").is_err());
        assert_eq!(svc.get_status("r").unwrap().state, RemoteRunState::Running);
        assert_eq!(svc.status_calls(), 2);
    }
}
