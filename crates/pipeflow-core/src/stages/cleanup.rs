//! Cleanup: purga el run directory de una ejecución terminal.
//!
//! Best-effort e idempotente: `delete_prefix` sobre un prefijo ya vacío
//! devuelve 0 y la stage marca `cleaned` igual. Los outputs cosechados viven
//! fuera del run directory y no se tocan.
use uuid::Uuid;

use super::{Stage, StageContext, StageOutcome};
use crate::errors::OrchestrationError;
use crate::scheduler::TaskKind;

pub struct CleanupStage;

impl Stage for CleanupStage {
    fn kind(&self) -> TaskKind {
        TaskKind::Cleanup
    }

    fn run(&self, ctx: &StageContext, execution_id: Uuid) -> Result<StageOutcome, OrchestrationError> {
        let execution = ctx.ports.repository.get_execution(execution_id)?;
        if execution.cleaned {
            return Ok(StageOutcome::Skipped("already cleaned".into()));
        }
        if !execution.state.is_terminal() {
            log::warn!("cleanup delivered for non-terminal execution execution_id={execution_id} state={}",
                       execution.state);
            return Ok(StageOutcome::Skipped(format!("execution is {}", execution.state)));
        }

        let deleted = match &execution.blob_run_directory {
            Some(run_dir) => ctx.ports.blobs.delete_prefix(&format!("{}/", run_dir.trim_end_matches('/')))?,
            None => 0,
        };

        // sólo se toca `cleaned` sobre el registro más reciente
        let mut fresh = ctx.ports.repository.get_execution(execution_id)?;
        let expected = fresh.state;
        fresh.cleaned = true;
        fresh.updated_at = ctx.ports.clock.now();
        if !ctx.ports.repository.save_execution_if(&fresh, expected)? {
            let actual = ctx.ports.repository.get_execution(execution_id)?.state;
            return Err(OrchestrationError::Superseded { expected, actual });
        }
        log::info!("cleaned execution_id={execution_id} state={} deleted_blobs={deleted}", fresh.state);
        Ok(StageOutcome::Advanced(fresh.state))
    }
}
