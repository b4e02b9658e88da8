//! Completion: cosecha outputs y metadata del manifest.
//!
//! Los sub-steps corren sobre `ContinuableSteps` en este orden fijo; los que
//! iteran join records persisten el cursor después de cada uno. Un error de
//! manifest corta la stage y deja la ejecución en `Completing`.
//!
//! Los archivos del manifest se emparejan con los join records por igualdad
//! exacta del PUID de la muestra; entradas sin muestra se ignoran.
use std::time::Duration;

use pipeflow_domain::{Activity, Attachable, AttachableKind, Attachment, AttachmentMetadata, ExecutionEvent,
                      ExecutionState, SamplesWorkflowExecution, WorkflowExecution};
use serde_json::json;
use uuid::Uuid;

use super::{guard, notify_if_requested, record_transition, Guard, Stage, StageContext, StageOutcome};
use crate::continuable::{ContinuableSteps, FINISHED};
use crate::errors::OrchestrationError;
use crate::manifest::{ManifestFile, OutputManifest};
use crate::scheduler::TaskKind;
use crate::storage::{attachment_key, filename_of, output_key};

pub const ATTACH_GLOBAL_OUTPUTS: &str = "attach_global_outputs";
pub const ATTACH_SAMPLE_OUTPUTS: &str = "attach_sample_outputs";
pub const ATTACH_SAMPLE_METADATA: &str = "attach_sample_metadata";
pub const MERGE_SAMPLE_METADATA: &str = "merge_sample_metadata";
pub const MERGE_SAMPLE_OUTPUTS: &str = "merge_sample_outputs";
pub const AUDIT_ACTIVITY: &str = "audit_activity";
pub const FINALIZE: &str = "finalize";
pub const ENQUEUE_CLEANUP: &str = "enqueue_cleanup";

pub const COMPLETION_STEPS: &[&str] = &[ATTACH_GLOBAL_OUTPUTS,
                                         ATTACH_SAMPLE_OUTPUTS,
                                         ATTACH_SAMPLE_METADATA,
                                         MERGE_SAMPLE_METADATA,
                                         MERGE_SAMPLE_OUTPUTS,
                                         AUDIT_ACTIVITY,
                                         FINALIZE,
                                         ENQUEUE_CLEANUP];

pub const AUTOMATED_COMPLETION_ACTIVITY: &str = "sample.automated_workflow_execution.completed";

pub struct CompletionStage;

fn run_dir_of(execution: &WorkflowExecution) -> Result<String, OrchestrationError> {
    execution.blob_run_directory
             .clone()
             .ok_or_else(|| OrchestrationError::Manifest(format!("execution {} has no run directory", execution.id)))
}

fn load_manifest(ctx: &StageContext, run_dir: &str) -> Result<OutputManifest, OrchestrationError> {
    let key = output_key(run_dir, &ctx.config.manifest_filename);
    let bytes = match ctx.ports.blobs.get(&key) {
        Ok(b) => b,
        Err(OrchestrationError::NotFound(_)) => {
            return Err(OrchestrationError::Manifest(format!("output manifest not found at {key}")));
        }
        Err(e) => return Err(e),
    };
    OutputManifest::from_gzip(&bytes)
}

/// Copia un output del run directory a una clave permanente y crea el
/// attachment.
fn harvest(ctx: &StageContext, run_dir: &str, file: &ManifestFile, owner: Attachable) -> Result<Attachment, OrchestrationError> {
    let source = output_key(run_dir, &file.path);
    let filename = filename_of(&file.path);
    let blob = ctx.ports
                  .blobs
                  .copy_with_key(&source, &attachment_key(&Uuid::new_v4().to_string(), filename))?;
    let attachment = Attachment::new(owner, blob, AttachmentMetadata::for_filename(filename), ctx.ports.clock.now());
    ctx.ports.repository.create_attachment(&attachment)?;
    log::debug!("harvested output attachable={}:{} path={} attachment_id={}",
                owner.kind.as_str(),
                owner.id,
                file.path,
                attachment.id);
    Ok(attachment)
}

impl CompletionStage {
    /// Entrada: `Completing`, o `Completed` con steps pendientes (la stage se
    /// cayó entre la transición final y el encolado de Cleanup).
    fn admit(ctx: &StageContext, execution_id: Uuid) -> Result<Guard, OrchestrationError> {
        let execution = ctx.ports.repository.get_execution(execution_id)?;
        let pending_tail = execution.state == ExecutionState::Completed
                           && execution.checkpoint.as_ref().map(|c| c.step_name != FINISHED).unwrap_or(false);
        if pending_tail {
            return Ok(Guard::Proceed(execution));
        }
        guard(ctx, TaskKind::Completion, execution_id, ExecutionState::Completed, |e| {
            e.state == ExecutionState::Completing
        })
    }

    fn joins(ctx: &StageContext, execution_id: Uuid) -> Result<Vec<SamplesWorkflowExecution>, OrchestrationError> {
        ctx.ports.repository.samples_workflow_executions(execution_id)
    }
}

impl Stage for CompletionStage {
    fn kind(&self) -> TaskKind {
        TaskKind::Completion
    }

    fn run(&self, ctx: &StageContext, execution_id: Uuid) -> Result<StageOutcome, OrchestrationError> {
        let mut execution = match Self::admit(ctx, execution_id)? {
            Guard::Proceed(e) => e,
            Guard::Stop(outcome) => return Ok(outcome),
        };
        let repo = ctx.ports.repository.as_ref();
        let run_dir = run_dir_of(&execution)?;
        let steps = ContinuableSteps::new(repo, COMPLETION_STEPS);
        let manifest = if execution.state == ExecutionState::Completing {
            load_manifest(ctx, &run_dir)?
        } else {
            OutputManifest::default()
        };

        steps.run_once(&mut execution, ATTACH_GLOBAL_OUTPUTS, |exec| {
                 let owner = Attachable::new(AttachableKind::WorkflowExecution, exec.id);
                 for file in &manifest.files.global {
                     harvest(ctx, &run_dir, file, owner)?;
                 }
                 Ok(())
             })?;

        let joins = Self::joins(ctx, execution_id)?;
        steps.run_each(&mut execution, ATTACH_SAMPLE_OUTPUTS, &joins, |_, _, join| {
                 let files = manifest.sample_files(&join.sample_puid);
                 if files.is_empty() {
                     return Ok(());
                 }
                 let owner = Attachable::new(AttachableKind::SamplesWorkflowExecution, join.id);
                 let mut updated = join.clone();
                 for file in files {
                     updated.outputs.push(harvest(ctx, &run_dir, file, owner)?.id);
                 }
                 repo.save_samples_workflow_execution(&updated)
             })?;

        let joins = Self::joins(ctx, execution_id)?;
        steps.run_each(&mut execution, ATTACH_SAMPLE_METADATA, &joins, |_, _, join| {
                 let metadata = manifest.sample_metadata(&join.sample_puid);
                 if metadata.is_empty() {
                     return Ok(());
                 }
                 let mut updated = join.clone();
                 updated.metadata.extend(metadata);
                 repo.save_samples_workflow_execution(&updated)
             })?;

        let joins = Self::joins(ctx, execution_id)?;
        if execution.update_samples {
            steps.run_each(&mut execution, MERGE_SAMPLE_METADATA, &joins, |exec, _, join| {
                     if join.metadata.is_empty() {
                         return Ok(());
                     }
                     let mut sample = repo.get_sample(join.sample_id)?;
                     let report = sample.merge_analysis_metadata(&join.metadata, exec.id, ctx.ports.clock.now());
                     log::debug!("sample metadata merged sample_id={} added={} updated={} protected={}",
                                 sample.id,
                                 report.added.len(),
                                 report.updated.len(),
                                 report.unchanged.len());
                     repo.save_sample(&sample)
                 })?;
            steps.run_each(&mut execution, MERGE_SAMPLE_OUTPUTS, &joins, |_, _, join| {
                     let owner = Attachable::new(AttachableKind::Sample, join.sample_id);
                     for output_id in &join.outputs {
                         let Some(output) = repo.get_attachment(*output_id)? else {
                             log::warn!("output attachment vanished attachment_id={output_id}");
                             continue;
                         };
                         let copy = Attachment::new(owner, output.blob.clone(), output.metadata.clone(), ctx.ports.clock.now());
                         repo.create_attachment(&copy)?;
                     }
                     Ok(())
                 })?;
        } else {
            steps.skip(&mut execution, MERGE_SAMPLE_METADATA)?;
            steps.skip(&mut execution, MERGE_SAMPLE_OUTPUTS)?;
        }

        if execution.submitter.is_automation() {
            steps.run_each(&mut execution, AUDIT_ACTIVITY, &joins, |exec, _, join| {
                     let activity = Activity { id: Uuid::new_v4(),
                                               key: AUTOMATED_COMPLETION_ACTIVITY.to_string(),
                                               trackable_id: join.sample_id,
                                               owner: exec.submitter.clone(),
                                               namespace: exec.namespace.clone(),
                                               parameters: json!({
                                                   "workflow_execution_id": exec.id,
                                                   "workflow_name": exec.workflow.name,
                                                   "workflow_version": exec.workflow.version,
                                                   "sample_puid": join.sample_puid,
                                               }),
                                               created_at: ctx.ports.clock.now() };
                     repo.create_activity(&activity)
                 })?;
        } else {
            steps.skip(&mut execution, AUDIT_ACTIVITY)?;
        }

        steps.run_once(&mut execution, FINALIZE, |exec| {
                 // reanudación tras caerse entre la transición y el checkpoint
                 if exec.state == ExecutionState::Completed {
                     return Ok(());
                 }
                 record_transition(ctx, exec, ExecutionEvent::Completed)?;
                 notify_if_requested(ctx, exec);
                 Ok(())
             })?;
        steps.run_once(&mut execution, ENQUEUE_CLEANUP, |exec| ctx.enqueue(TaskKind::Cleanup, exec.id, Duration::ZERO))?;

        if execution.state == ExecutionState::Error {
            return Ok(StageOutcome::Skipped("execution errored during completion".into()));
        }
        log::info!("completion finished execution_id={} samples={}", execution.id, joins.len());
        Ok(StageOutcome::Advanced(execution.state))
    }
}
