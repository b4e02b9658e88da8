//! Agregado raíz `WorkflowExecution`.
//!
//! Invariantes que mantienen las stages (no este tipo por sí solo):
//! - `run_id` presente si y sólo si la ejecución pasó por Submission.
//! - `blob_run_directory` presente si y sólo si pasó por Preparation.
//! - `cleaned == true` implica que no quedan blobs bajo el run directory.
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::state::{transition, ExecutionEvent, ExecutionState, StateChange, TransitionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalKind {
    User,
    /// Bot de ejecuciones automatizadas; dispara actividades de auditoría.
    Automation,
}

/// Referencia débil al principal que envió la ejecución.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submitter {
    pub id: Uuid,
    pub kind: PrincipalKind,
    pub email: Option<String>,
}

impl Submitter {
    pub fn user(id: Uuid) -> Self {
        Self { id,
               kind: PrincipalKind::User,
               email: None }
    }

    pub fn automation(id: Uuid) -> Self {
        Self { id,
               kind: PrincipalKind::Automation,
               email: None }
    }

    pub fn is_automation(&self) -> bool {
        self.kind == PrincipalKind::Automation
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamespaceKind {
    Project,
    Group,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceRef {
    pub id: Uuid,
    pub kind: NamespaceKind,
    pub puid: String,
}

/// Nombre + versión del pipeline en el registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowRef {
    pub name: String,
    pub version: String,
}

impl WorkflowRef {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self { name: name.into(),
               version: version.into() }
    }
}

/// Progreso persistido de un step continuable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub step_name: String,
    pub cursor: usize,
}

impl Checkpoint {
    pub fn start(step_name: &str) -> Self {
        Self { step_name: step_name.to_string(),
               cursor: 0 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub name: Option<String>,
    pub state: ExecutionState,
    pub cleaned: bool,
    pub run_id: Option<String>,
    pub http_error_code: Option<u16>,
    pub submitter: Submitter,
    pub namespace: Option<NamespaceRef>,
    pub workflow: WorkflowRef,
    pub workflow_params: IndexMap<String, Value>,
    pub blob_run_directory: Option<String>,
    pub email_notification: bool,
    pub update_samples: bool,
    #[serde(default)]
    pub checkpoint: Option<Checkpoint>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowExecution {
    /// Nueva ejecución en el estado canónico `Initial`.
    pub fn new(submitter: Submitter, namespace: Option<NamespaceRef>, workflow: WorkflowRef, now: DateTime<Utc>) -> Self {
        Self { id: Uuid::new_v4(),
               name: None,
               state: ExecutionState::Initial,
               cleaned: false,
               run_id: None,
               http_error_code: None,
               submitter,
               namespace,
               workflow,
               workflow_params: IndexMap::new(),
               blob_run_directory: None,
               email_notification: false,
               update_samples: false,
               checkpoint: None,
               created_at: now,
               updated_at: now }
    }

    /// Aplica un evento validando la transición y devuelve la entrada del
    /// change log correspondiente.
    pub fn apply(&mut self, event: ExecutionEvent, at: DateTime<Utc>) -> Result<StateChange, TransitionError> {
        let next = transition(self.state, event)?;
        Ok(self.set_state(next, at))
    }

    /// Fuerza `Error` sin validar la transición. Devuelve `None` si la
    /// ejecución ya estaba en un estado terminal.
    pub fn force_error(&mut self, http_error_code: Option<u16>, at: DateTime<Utc>) -> Option<StateChange> {
        if self.state.is_terminal() {
            return None;
        }
        if http_error_code.is_some() {
            self.http_error_code = http_error_code;
        }
        Some(self.set_state(ExecutionState::Error, at))
    }

    fn set_state(&mut self, next: ExecutionState, at: DateTime<Utc>) -> StateChange {
        let change = StateChange { execution_id: self.id,
                                   from: self.state,
                                   to: next,
                                   at };
        self.state = next;
        self.updated_at = at;
        change
    }

    /// Merge (nunca reemplazo completo) sobre `workflow_params`.
    pub fn merge_params<I>(&mut self, overrides: I)
        where I: IntoIterator<Item = (String, Value)>
    {
        for (k, v) in overrides {
            self.workflow_params.insert(k, v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn execution() -> WorkflowExecution {
        WorkflowExecution::new(Submitter::user(Uuid::new_v4()),
                               None,
                               WorkflowRef::new("phac-nml/iridanextexample", "1.0.2"),
                               Utc::now())
    }

    #[test]
    fn new_execution_starts_initial_and_unclean() {
        let e = execution();
        assert_eq!(e.state, ExecutionState::Initial);
        assert!(!e.cleaned);
        assert!(e.run_id.is_none());
        assert!(e.blob_run_directory.is_none());
    }

    #[test]
    fn force_error_records_code_and_is_noop_when_terminal() {
        let mut e = execution();
        let change = e.force_error(Some(500), Utc::now()).expect("change");
        assert_eq!(change.from, ExecutionState::Initial);
        assert_eq!(e.state, ExecutionState::Error);
        assert_eq!(e.http_error_code, Some(500));
        assert!(e.force_error(Some(404), Utc::now()).is_none());
        assert_eq!(e.http_error_code, Some(500));
    }

    #[test]
    fn merge_params_keeps_existing_keys() {
        let mut e = execution();
        e.workflow_params.insert("assembler".into(), json!("stub"));
        e.merge_params([("input".to_string(), json!("s3://b/x/samplesheet.csv"))]);
        assert_eq!(e.workflow_params.len(), 2);
        assert_eq!(e.workflow_params.get_index(0).map(|(k, _)| k.as_str()), Some("assembler"));
    }
}
