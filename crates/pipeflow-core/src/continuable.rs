//! Ejecutor de steps continuables con cursor persistido.
//!
//! Rol en el flujo:
//! - Una lista ordenada de steps con nombre; el checkpoint
//!   `Checkpoint{step_name, cursor}` vive en el registro de la ejecución y
//!   apunta al step en curso.
//! - `run_each` avanza y persiste el cursor después de cada elemento; al
//!   reanudar sólo procesa la cola pendiente.
//! - `run_once` es un step singleton: corre completo o no corre.
//! - Antes de cada step se relee el estado persistido; si la ejecución ya está
//!   en `Error` el step no hace nada.
//!
//! Caveat: si el proceso muere entre el efecto de un elemento y la
//! persistencia de su cursor, ese efecto se repite al reanudar. Los efectos por
//! elemento deben tolerar una repetición.
use pipeflow_domain::{Checkpoint, ExecutionState, WorkflowExecution};

use crate::errors::OrchestrationError;
use crate::ports::ExecutionRepository;

/// Marca del checkpoint una vez terminados todos los steps.
pub const FINISHED: &str = "__finished";

const PERSIST_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// El step corrió (completo o desde el cursor) en esta invocación.
    Ran,
    /// El checkpoint indica que el step ya había terminado.
    AlreadyDone,
    /// La ejecución está en `Error`; no se hizo nada.
    Aborted,
}

pub struct ContinuableSteps<'a> {
    repository: &'a dyn ExecutionRepository,
    steps: &'a [&'a str],
}

impl<'a> ContinuableSteps<'a> {
    pub fn new(repository: &'a dyn ExecutionRepository, steps: &'a [&'a str]) -> Self {
        Self { repository, steps }
    }

    fn index_of(&self, name: &str) -> Result<usize, OrchestrationError> {
        if name == FINISHED {
            return Ok(self.steps.len());
        }
        self.steps
            .iter()
            .position(|s| *s == name)
            .ok_or_else(|| OrchestrationError::Validation(format!("unknown continuable step '{name}'")))
    }

    /// Índice del step en curso según el checkpoint (0 si no hay).
    fn current_index(&self, execution: &WorkflowExecution) -> Result<usize, OrchestrationError> {
        match &execution.checkpoint {
            Some(cp) => self.index_of(&cp.step_name),
            None => Ok(0),
        }
    }

    pub fn is_finished(&self, execution: &WorkflowExecution) -> bool {
        matches!(&execution.checkpoint, Some(cp) if cp.step_name == FINISHED)
    }

    /// Persiste sólo el checkpoint sobre el registro fresco, sin pisar otros
    /// campos que otra stage pudo haber cambiado.
    fn persist(&self, execution: &mut WorkflowExecution, checkpoint: Checkpoint) -> Result<(), OrchestrationError> {
        let mut attempts = 0;
        loop {
            let mut fresh = self.repository.get_execution(execution.id)?;
            let expected = fresh.state;
            fresh.checkpoint = Some(checkpoint.clone());
            if self.repository.save_execution_if(&fresh, expected)? {
                execution.checkpoint = Some(checkpoint);
                execution.state = fresh.state;
                return Ok(());
            }
            attempts += 1;
            if attempts >= PERSIST_ATTEMPTS {
                let actual = self.repository.get_execution(execution.id)?.state;
                return Err(OrchestrationError::Superseded { expected, actual });
            }
        }
    }

    fn advance_past(&self, execution: &mut WorkflowExecution, idx: usize) -> Result<(), OrchestrationError> {
        let next = self.steps.get(idx + 1).copied().unwrap_or(FINISHED);
        self.persist(execution, Checkpoint::start(next))
    }

    /// Preparación común: valida el nombre, mira el estado persistido y
    /// devuelve `(índice, cursor de inicio)` o el outcome anticipado.
    fn enter(&self, execution: &mut WorkflowExecution, name: &str) -> Result<Result<(usize, usize), StepOutcome>, OrchestrationError> {
        let idx = self.index_of(name)?;
        let current = self.current_index(execution)?;
        if idx < current {
            return Ok(Err(StepOutcome::AlreadyDone));
        }
        let fresh = self.repository.get_execution(execution.id)?;
        execution.state = fresh.state;
        if fresh.state == ExecutionState::Error {
            log::debug!("continuable step aborted execution_id={} step={name} state=error", execution.id);
            return Ok(Err(StepOutcome::Aborted));
        }
        let cursor = match &execution.checkpoint {
            Some(cp) if cp.step_name == name => cp.cursor,
            _ => 0,
        };
        Ok(Ok((idx, cursor)))
    }

    /// Step singleton.
    pub fn run_once<F>(&self, execution: &mut WorkflowExecution, name: &str, f: F) -> Result<StepOutcome, OrchestrationError>
        where F: FnOnce(&mut WorkflowExecution) -> Result<(), OrchestrationError>
    {
        let (idx, _) = match self.enter(execution, name)? {
            Ok(pos) => pos,
            Err(outcome) => return Ok(outcome),
        };
        f(execution)?;
        self.advance_past(execution, idx)?;
        Ok(StepOutcome::Ran)
    }

    /// Step con cursor sobre `items` (orden estable). `f` recibe el índice
    /// absoluto y el elemento. Un error corta el step dejando el cursor en el
    /// último elemento completado.
    pub fn run_each<T, F>(&self,
                          execution: &mut WorkflowExecution,
                          name: &str,
                          items: &[T],
                          mut f: F)
                          -> Result<StepOutcome, OrchestrationError>
        where F: FnMut(&mut WorkflowExecution, usize, &T) -> Result<(), OrchestrationError>
    {
        let (idx, start) = match self.enter(execution, name)? {
            Ok(pos) => pos,
            Err(outcome) => return Ok(outcome),
        };
        if start > 0 {
            log::info!("resuming step execution_id={} step={name} cursor={start} total={}", execution.id, items.len());
        }
        for (i, item) in items.iter().enumerate().skip(start) {
            f(execution, i, item)?;
            self.persist(execution,
                         Checkpoint { step_name: name.to_string(),
                                      cursor: i + 1 })?;
        }
        self.advance_past(execution, idx)?;
        Ok(StepOutcome::Ran)
    }

    /// Step que no aplica en esta ejecución (p. ej. `update_samples=false`):
    /// sólo avanza el checkpoint.
    pub fn skip(&self, execution: &mut WorkflowExecution, name: &str) -> Result<StepOutcome, OrchestrationError> {
        match self.enter(execution, name)? {
            Ok((idx, _)) => {
                self.advance_past(execution, idx)?;
                Ok(StepOutcome::Ran)
            }
            Err(outcome) => Ok(outcome),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryExecutionRepository;
    use chrono::Utc;
    use pipeflow_domain::{Submitter, WorkflowRef};

    const STEPS: &[&str] = &["global", "per_sample", "final"];

    fn setup() -> (InMemoryExecutionRepository, WorkflowExecution) {
        let repo = InMemoryExecutionRepository::new();
        let mut exec = WorkflowExecution::new(Submitter::user(uuid::Uuid::new_v4()),
                                              None,
                                              WorkflowRef::new("p", "1"),
                                              Utc::now());
        exec.state = ExecutionState::Completing;
        repo.insert_execution(&exec, &[]).unwrap();
        (repo, exec)
    }

    #[test]
    fn resume_processes_only_the_unprocessed_tail() {
        let (repo, mut exec) = setup();
        let runner = ContinuableSteps::new(&repo, STEPS);
        let items: Vec<u32> = (0..7).collect();
        let k = 4;

        let mut first = Vec::new();
        runner.run_once(&mut exec, "global", |_| Ok(())).unwrap();
        let err = runner.run_each(&mut exec, "per_sample", &items, |_, i, _| {
                            if i == k {
                                return Err(OrchestrationError::Staging("crash".into()));
                            }
                            first.push(i);
                            Ok(())
                        });
        assert!(err.is_err());
        assert_eq!(first, vec![0, 1, 2, 3]);
        let persisted = repo.get_execution(exec.id).unwrap().checkpoint.unwrap();
        assert_eq!(persisted, Checkpoint { step_name: "per_sample".into(), cursor: k });

        // reanudación desde el registro persistido
        let mut resumed = repo.get_execution(exec.id).unwrap();
        let mut global_ran = false;
        assert_eq!(runner.run_once(&mut resumed, "global", |_| {
                              global_ran = true;
                              Ok(())
                          })
                          .unwrap(),
                   StepOutcome::AlreadyDone);
        assert!(!global_ran);
        let mut second = Vec::new();
        runner.run_each(&mut resumed, "per_sample", &items, |_, i, _| {
                  second.push(i);
                  Ok(())
              })
              .unwrap();
        assert_eq!(second, (k..items.len()).collect::<Vec<_>>());
        runner.run_once(&mut resumed, "final", |_| Ok(())).unwrap();
        assert!(runner.is_finished(&resumed));
    }

    #[test]
    fn steps_abort_when_execution_errored() {
        let (repo, mut exec) = setup();
        let mut stored = repo.get_execution(exec.id).unwrap();
        stored.state = ExecutionState::Error;
        repo.save_execution(&stored).unwrap();

        let runner = ContinuableSteps::new(&repo, STEPS);
        let mut ran = false;
        let out = runner.run_once(&mut exec, "global", |_| {
                            ran = true;
                            Ok(())
                        })
                        .unwrap();
        assert_eq!(out, StepOutcome::Aborted);
        assert!(!ran);
        assert_eq!(exec.state, ExecutionState::Error);
    }

    #[test]
    fn unknown_step_is_rejected() {
        let (repo, mut exec) = setup();
        let runner = ContinuableSteps::new(&repo, STEPS);
        assert!(runner.run_once(&mut exec, "nope", |_| Ok(())).is_err());
    }
}
