//! Máquina de estados de una `WorkflowExecution`.
//!
//! Rol en el flujo:
//! - `ExecutionState` es el enum cerrado que vive en el registro de la
//!   ejecución y que sólo las stages mutan.
//! - `transition` es una función pura: dado el estado actual y un evento,
//!   devuelve el siguiente estado o un `TransitionError`. No toca persistencia.
//! - `StateChange` es la entrada del change log durable; el status poll lo usa
//!   para medir el tiempo real en `Running`.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::DomainError;

/// Estados de una ejecución.
///
/// Camino feliz: `Initial -> Prepared -> Submitted -> Running -> Completing ->
/// Completed`. `Canceling -> Canceled` y `Error` son alcanzables desde
/// cualquier estado no terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Initial,
    Prepared,
    Submitted,
    Running,
    Completing,
    Completed,
    Canceling,
    Canceled,
    Error,
}

impl ExecutionState {
    /// `Completed`, `Canceled` y `Error` no admiten más transiciones.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Canceled | Self::Error)
    }

    /// Estados que indican una cancelación en curso o terminada.
    pub fn is_cancel_path(self) -> bool {
        matches!(self, Self::Canceling | Self::Canceled)
    }

    /// Posición en el camino feliz `Initial → … → Completed`. `None` para los
    /// estados de cancelación y `Error`.
    pub fn progress(self) -> Option<u8> {
        match self {
            Self::Initial => Some(0),
            Self::Prepared => Some(1),
            Self::Submitted => Some(2),
            Self::Running => Some(3),
            Self::Completing => Some(4),
            Self::Completed => Some(5),
            Self::Canceling | Self::Canceled | Self::Error => None,
        }
    }

    /// `true` si la ejecución ya está en `target` o más adelante en el camino
    /// feliz.
    pub fn has_reached(self, target: ExecutionState) -> bool {
        matches!((self.progress(), target.progress()), (Some(now), Some(t)) if now >= t)
    }

    /// La ejecución ya fue entregada al servicio remoto.
    pub fn has_been_submitted(self) -> bool {
        matches!(self, Self::Submitted | Self::Running | Self::Completing | Self::Completed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Prepared => "prepared",
            Self::Submitted => "submitted",
            Self::Running => "running",
            Self::Completing => "completing",
            Self::Completed => "completed",
            Self::Canceling => "canceling",
            Self::Canceled => "canceled",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "initial" => Self::Initial,
            "prepared" => Self::Prepared,
            "submitted" => Self::Submitted,
            "running" => Self::Running,
            "completing" => Self::Completing,
            "completed" => Self::Completed,
            "canceling" => Self::Canceling,
            "canceled" => Self::Canceled,
            "error" => Self::Error,
            other => return Err(DomainError::ValidationError(format!("unknown execution state '{other}'"))),
        })
    }
}

/// Eventos que disparan transiciones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionEvent {
    /// Preparation terminó de montar el run directory y el samplesheet.
    Prepared,
    /// Submission obtuvo un `run_id` del servicio remoto.
    Submitted,
    /// El servicio remoto reporta `RUNNING`.
    RemoteRunning,
    /// El servicio remoto reporta `COMPLETE`.
    RemoteComplete,
    /// El servicio remoto reporta un código de cancelación.
    RemoteCanceled,
    /// El servicio remoto reporta un código de error.
    RemoteFailed,
    /// Completion terminó todos sus sub-steps.
    Completed,
    /// Cancelación pedida por un usuario o por el límite de runtime.
    CancelRequested,
    /// El servicio remoto aceptó la cancelación.
    CancelConfirmed,
    /// Falla forzada (validación, reintentos agotados, staging).
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition from {from} on {event:?}")]
pub struct TransitionError {
    pub from: ExecutionState,
    pub event: ExecutionEvent,
}

/// Función pura de transición.
pub fn transition(current: ExecutionState, event: ExecutionEvent) -> Result<ExecutionState, TransitionError> {
    use ExecutionEvent as Ev;
    use ExecutionState as St;

    let next = match (current, event) {
        (St::Initial, Ev::Prepared) => St::Prepared,
        (St::Prepared, Ev::Submitted) => St::Submitted,
        (St::Submitted | St::Running, Ev::RemoteRunning) => St::Running,
        (St::Submitted | St::Running, Ev::RemoteComplete) => St::Completing,
        (St::Completing, Ev::Completed) => St::Completed,
        (St::Initial | St::Prepared | St::Submitted | St::Running | St::Completing, Ev::CancelRequested) => St::Canceling,
        (St::Canceling, Ev::CancelConfirmed) => St::Canceled,
        (s, Ev::RemoteCanceled) if !s.is_terminal() => St::Canceled,
        (s, Ev::RemoteFailed | Ev::Failed) if !s.is_terminal() => St::Error,
        (from, event) => return Err(TransitionError { from, event }),
    };
    Ok(next)
}

/// Entrada del change log durable de estados.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub execution_id: Uuid,
    pub from: ExecutionState,
    pub to: ExecutionState,
    pub at: DateTime<Utc>,
}

/// Momento en que la ejecución entró por última vez a `state`, según el log.
pub fn entered_at(changes: &[StateChange], state: ExecutionState) -> Option<DateTime<Utc>> {
    changes.iter()
           .rev()
           .find(|c| c.to == state && c.from != state)
           .map(|c| c.at)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_reaches_completed() {
        let mut s = ExecutionState::Initial;
        for ev in [ExecutionEvent::Prepared,
                   ExecutionEvent::Submitted,
                   ExecutionEvent::RemoteRunning,
                   ExecutionEvent::RemoteRunning,
                   ExecutionEvent::RemoteComplete,
                   ExecutionEvent::Completed]
        {
            s = transition(s, ev).expect("valid transition");
        }
        assert_eq!(s, ExecutionState::Completed);
    }

    #[test]
    fn terminal_states_reject_everything() {
        for s in [ExecutionState::Completed, ExecutionState::Canceled, ExecutionState::Error] {
            assert!(transition(s, ExecutionEvent::Failed).is_err());
            assert!(transition(s, ExecutionEvent::CancelRequested).is_err());
            assert!(transition(s, ExecutionEvent::RemoteRunning).is_err());
        }
    }

    #[test]
    fn prepare_requires_initial() {
        let err = transition(ExecutionState::Prepared, ExecutionEvent::Prepared).unwrap_err();
        assert_eq!(err.from, ExecutionState::Prepared);
    }

    #[test]
    fn error_and_cancel_reachable_from_non_terminal() {
        for s in [ExecutionState::Initial,
                  ExecutionState::Prepared,
                  ExecutionState::Submitted,
                  ExecutionState::Running,
                  ExecutionState::Completing,
                  ExecutionState::Canceling]
        {
            assert_eq!(transition(s, ExecutionEvent::Failed), Ok(ExecutionState::Error));
        }
        assert_eq!(transition(ExecutionState::Running, ExecutionEvent::CancelRequested),
                   Ok(ExecutionState::Canceling));
        assert_eq!(transition(ExecutionState::Canceling, ExecutionEvent::CancelConfirmed),
                   Ok(ExecutionState::Canceled));
        assert!(transition(ExecutionState::Canceling, ExecutionEvent::CancelRequested).is_err());
    }

    #[test]
    fn state_round_trips_through_str() {
        for s in [ExecutionState::Initial, ExecutionState::Completing, ExecutionState::Error] {
            assert_eq!(s.as_str().parse::<ExecutionState>().unwrap(), s);
        }
        assert!("new".parse::<ExecutionState>().is_err());
    }

    #[test]
    fn reached_follows_the_happy_path_only() {
        assert!(ExecutionState::Completing.has_reached(ExecutionState::Submitted));
        assert!(ExecutionState::Prepared.has_reached(ExecutionState::Prepared));
        assert!(!ExecutionState::Submitted.has_reached(ExecutionState::Completing));
        assert!(!ExecutionState::Canceling.has_reached(ExecutionState::Prepared));
        assert!(!ExecutionState::Running.has_reached(ExecutionState::Canceled));
    }

    #[test]
    fn entered_at_ignores_self_transitions() {
        let id = Uuid::new_v4();
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(10);
        let changes = vec![StateChange { execution_id: id,
                                         from: ExecutionState::Submitted,
                                         to: ExecutionState::Running,
                                         at: t0 },
                           StateChange { execution_id: id,
                                         from: ExecutionState::Running,
                                         to: ExecutionState::Running,
                                         at: t1 }];
        assert_eq!(entered_at(&changes, ExecutionState::Running), Some(t0));
        assert_eq!(entered_at(&changes, ExecutionState::Completing), None);
    }
}
