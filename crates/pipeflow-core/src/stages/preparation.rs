//! Preparation: monta el run directory y el samplesheet.
//!
//! Cualquier falla durante la preparación fuerza `Error` y encola Cleanup; el
//! run directory queda registrado para que Cleanup purgue las copias
//! parciales. El run directory sale del id de la ejecución: una entrega
//! repetida tras una caída re-escribe el mismo prefijo.
use pipeflow_domain::{ExecutionEvent, ExecutionState, WorkflowExecution};
use serde_json::Value;
use uuid::Uuid;

use super::{fail_execution, guard, record_transition, Guard, Stage, StageContext, StageOutcome};
use crate::errors::OrchestrationError;
use crate::samplesheet::SamplesheetBuilder;
use crate::scheduler::TaskKind;
use crate::storage::{output_prefix, run_dir as run_dir_for, samplesheet_key, SAMPLESHEET_FILENAME};

pub struct PreparationStage;

impl Stage for PreparationStage {
    fn kind(&self) -> TaskKind {
        TaskKind::Preparation
    }

    fn run(&self, ctx: &StageContext, execution_id: Uuid) -> Result<StageOutcome, OrchestrationError> {
        let mut execution =
            match guard(ctx, self.kind(), execution_id, ExecutionState::Prepared, |e| e.state == ExecutionState::Initial)? {
                Guard::Proceed(e) => e,
                Guard::Stop(outcome) => return Ok(outcome),
            };

        let run_dir = execution.blob_run_directory
                               .clone()
                               .unwrap_or_else(|| run_dir_for(&ctx.config.runs_prefix, &execution.id));
        match prepare(ctx, &mut execution, &run_dir) {
            Ok(()) => {
                record_transition(ctx, &mut execution, ExecutionEvent::Prepared)?;
                ctx.enqueue(TaskKind::Submission, execution.id, ctx.config.submission_delay)?;
                Ok(StageOutcome::Advanced(execution.state))
            }
            Err(e) => {
                let reason = format!("preparation failed: {e}");
                // el registro persistido no tiene aún el run dir
                execution.blob_run_directory = Some(run_dir);
                fail_execution(ctx, execution, None, &reason)
            }
        }
    }
}

fn prepare(ctx: &StageContext, execution: &mut WorkflowExecution, run_dir: &str) -> Result<(), OrchestrationError> {
    let pipeline = ctx.pipeline_for(execution)?;
    let coerced = pipeline.coerce_params(&execution.workflow_params)?;
    execution.merge_params(coerced);

    let repo = ctx.ports.repository.as_ref();
    let blobs = ctx.ports.blobs.as_ref();
    let joins = repo.samples_workflow_executions(execution.id)?;
    if joins.is_empty() {
        return Err(OrchestrationError::Validation("execution has no samples".into()));
    }

    let staged = SamplesheetBuilder::new(repo, blobs).build(run_dir, &pipeline.samplesheet_headers, &joins)?;
    for row in &staged.rows {
        repo.save_samples_workflow_execution(row)?;
    }

    let sheet_key = samplesheet_key(run_dir);
    blobs.put_with_key(&sheet_key, &staged.csv, SAMPLESHEET_FILENAME)?;

    execution.merge_params([("input".to_string(), Value::String(blobs.resolve_uri(&sheet_key))),
                            ("outdir".to_string(), Value::String(blobs.resolve_uri(&output_prefix(run_dir))))]);
    execution.blob_run_directory = Some(run_dir.to_string());
    log::info!("prepared execution_id={} run_dir={run_dir} samples={} staged_inputs={}",
               execution.id,
               staged.rows.len(),
               staged.staged_inputs);
    Ok(())
}
