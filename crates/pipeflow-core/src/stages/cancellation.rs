//! Cancellation: pide la cancelación remota y cierra la ejecución.
use std::time::Duration;

use pipeflow_domain::{ExecutionEvent, ExecutionState};
use uuid::Uuid;

use super::{guard, record_transition, Guard, Stage, StageContext, StageOutcome};
use crate::errors::OrchestrationError;
use crate::scheduler::TaskKind;

pub struct CancellationStage;

impl Stage for CancellationStage {
    fn kind(&self) -> TaskKind {
        TaskKind::Cancellation
    }

    fn run(&self, ctx: &StageContext, execution_id: Uuid) -> Result<StageOutcome, OrchestrationError> {
        let mut execution =
            match guard(ctx, self.kind(), execution_id, ExecutionState::Canceled, |e| e.state == ExecutionState::Canceling)? {
                Guard::Proceed(e) => e,
                Guard::Stop(outcome) => return Ok(outcome),
            };

        // cancelada antes de llegar al servicio remoto
        if let Some(run_id) = execution.run_id.clone() {
            ctx.ports.execution_service.cancel(&run_id)?;
            log::info!("remote cancel requested execution_id={} run_id={run_id}", execution.id);
        }
        record_transition(ctx, &mut execution, ExecutionEvent::CancelConfirmed)?;
        ctx.enqueue(TaskKind::Cleanup, execution.id, Duration::ZERO)?;
        Ok(StageOutcome::Advanced(execution.state))
    }
}
