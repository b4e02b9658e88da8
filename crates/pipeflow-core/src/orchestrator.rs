//! API de entrada: crear ejecuciones y pedir su cancelación.
use indexmap::IndexMap;
use pipeflow_domain::{ExecutionEvent, NamespaceRef, SamplesWorkflowExecution, Submitter, WorkflowExecution, WorkflowRef};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

use crate::errors::OrchestrationError;
use crate::scheduler::TaskKind;
use crate::stages::{record_transition, StageContext};

const CANCEL_ATTEMPTS: u32 = 3;

/// Muestra seleccionada para una ejecución.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSample {
    pub sample_id: Uuid,
    pub sample_puid: String,
    pub samplesheet_params: IndexMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewExecution {
    pub name: Option<String>,
    pub submitter: Submitter,
    pub namespace: Option<NamespaceRef>,
    pub workflow: WorkflowRef,
    #[serde(default)]
    pub workflow_params: IndexMap<String, Value>,
    pub samples: Vec<NewSample>,
    #[serde(default)]
    pub email_notification: bool,
    #[serde(default)]
    pub update_samples: bool,
}

pub struct Orchestrator {
    ctx: StageContext,
}

impl Orchestrator {
    pub fn new(ctx: StageContext) -> Self {
        Self { ctx }
    }

    /// Valida el pipeline, fusiona los defaults del esquema, crea los join
    /// records en orden y encola Preparation.
    pub fn create_execution(&self, request: NewExecution) -> Result<WorkflowExecution, OrchestrationError> {
        let pipeline = self.ctx
                           .ports
                           .registry
                           .find(&request.workflow)
                           .ok_or_else(|| {
                               OrchestrationError::Validation(format!("pipeline {}@{} is not registered",
                                                                      request.workflow.name,
                                                                      request.workflow.version))
                           })?;
        if request.samples.is_empty() {
            return Err(OrchestrationError::Validation("at least one sample is required".into()));
        }

        let mut execution =
            WorkflowExecution::new(request.submitter, request.namespace, request.workflow, self.ctx.ports.clock.now());
        execution.name = request.name;
        execution.email_notification = request.email_notification;
        execution.update_samples = request.update_samples;
        execution.merge_params(pipeline.default_params());
        execution.merge_params(request.workflow_params);

        let joins: Vec<SamplesWorkflowExecution> = request.samples
                                                          .into_iter()
                                                          .enumerate()
                                                          .map(|(position, s)| {
                                                              SamplesWorkflowExecution::new(execution.id,
                                                                                            s.sample_id,
                                                                                            s.sample_puid,
                                                                                            position,
                                                                                            s.samplesheet_params)
                                                          })
                                                          .collect();
        self.ctx.ports.repository.insert_execution(&execution, &joins)?;
        self.ctx.enqueue(TaskKind::Preparation, execution.id, self.ctx.config.preparation_delay)?;
        log::info!("execution created execution_id={} workflow={}@{} samples={}",
                   execution.id,
                   execution.workflow.name,
                   execution.workflow.version,
                   joins.len());
        Ok(execution)
    }

    /// Pasa una ejecución no terminal a `Canceling` y encola Cancellation. Si
    /// ya está cancelándose no hace nada.
    ///
    /// Si una stage mueve el estado entre la lectura y la escritura, relee y
    /// vuelve a intentar.
    pub fn cancel(&self, execution_id: Uuid) -> Result<WorkflowExecution, OrchestrationError> {
        let mut attempts = 0;
        loop {
            let mut execution = self.ctx.ports.repository.get_execution(execution_id)?;
            if execution.state.is_cancel_path() {
                return Ok(execution);
            }
            if execution.state.is_terminal() {
                return Err(OrchestrationError::Validation(format!("execution {execution_id} is already {}",
                                                                  execution.state)));
            }
            match record_transition(&self.ctx, &mut execution, ExecutionEvent::CancelRequested) {
                Ok(_) => {
                    self.ctx.enqueue(TaskKind::Cancellation, execution.id, Duration::ZERO)?;
                    return Ok(execution);
                }
                Err(OrchestrationError::Superseded { .. }) if attempts < CANCEL_ATTEMPTS => attempts += 1,
                Err(e) => return Err(e),
            }
        }
    }
}
