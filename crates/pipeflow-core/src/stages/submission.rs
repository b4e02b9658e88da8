//! Submission: entrega el run al servicio remoto.
//!
//! Errores del cliente se propagan tal cual; el worker decide el reintento
//! (conectividad sin tope, API hasta agotar y luego `Error`).
use indexmap::IndexMap;
use pipeflow_domain::{ExecutionEvent, ExecutionState, PipelineDefinition, WorkflowExecution};
use serde_json::Value;
use uuid::Uuid;

use super::{guard, record_transition, Guard, Stage, StageContext, StageOutcome};
use crate::errors::OrchestrationError;
use crate::ports::RunRequest;
use crate::scheduler::TaskKind;

pub struct SubmissionStage;

/// Arma el cuerpo del run a partir de la ejecución y su pipeline.
pub fn build_run_request(execution: &WorkflowExecution, pipeline: &PipelineDefinition, samples_count: usize) -> RunRequest {
    let params: serde_json::Map<String, Value> = execution.workflow_params
                                                          .iter()
                                                          .map(|(k, v)| (k.clone(), v.clone()))
                                                          .collect();
    let mut engine_params = IndexMap::new();
    engine_params.insert("-r".to_string(), pipeline.version.clone());

    let mut tags = IndexMap::new();
    tags.insert("created_by".to_string(), execution.submitter.id.to_string());
    tags.insert("namespace_id".to_string(),
                execution.namespace.as_ref().map(|n| n.id.to_string()).unwrap_or_default());
    tags.insert("samples_count".to_string(), samples_count.to_string());

    let engine = &pipeline.engine;
    RunRequest { workflow_params: Value::Object(params),
                 workflow_type: engine.workflow_type.clone(),
                 workflow_type_version: engine.workflow_type_version.clone(),
                 workflow_engine: engine.workflow_engine.clone(),
                 workflow_engine_version: engine.workflow_engine_version.clone(),
                 workflow_engine_parameters: engine_params,
                 workflow_url: pipeline.url.clone(),
                 tags }
}

impl Stage for SubmissionStage {
    fn kind(&self) -> TaskKind {
        TaskKind::Submission
    }

    fn run(&self, ctx: &StageContext, execution_id: Uuid) -> Result<StageOutcome, OrchestrationError> {
        let mut execution =
            match guard(ctx, self.kind(), execution_id, ExecutionState::Submitted, |e| e.state == ExecutionState::Prepared)? {
                Guard::Proceed(e) => e,
                Guard::Stop(outcome) => return Ok(outcome),
            };
        let pipeline = ctx.pipeline_for(&execution)?;
        let samples_count = ctx.ports.repository.samples_workflow_executions(execution.id)?.len();
        let request = build_run_request(&execution, &pipeline, samples_count);

        let run_id = ctx.ports.execution_service.submit(&request)?;
        log::info!("submitted execution_id={} run_id={run_id}", execution.id);
        execution.run_id = Some(run_id);
        record_transition(ctx, &mut execution, ExecutionEvent::Submitted)?;

        let interval = ctx.status_check_interval(Some(&pipeline));
        ctx.enqueue(TaskKind::StatusPoll, execution.id, interval)?;
        Ok(StageOutcome::Advanced(execution.state))
    }
}
