use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::execution::{NamespaceRef, Submitter};

/// Entrada de auditoría visible para el usuario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub id: Uuid,
    pub key: String,
    pub trackable_id: Uuid,
    pub owner: Submitter,
    pub namespace: Option<NamespaceRef>,
    pub parameters: Value,
    pub created_at: DateTime<Utc>,
}
