//! Definiciones del Pipeline Registry: headers del samplesheet, esquema de
//! parámetros y settings de polling/runtime por pipeline.
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DomainError;
use crate::execution::WorkflowRef;

/// Tipo declarado de un parámetro en el esquema del pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    Integer,
    Number,
    Boolean,
    String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    #[serde(rename = "type")]
    pub kind: ParamKind,
    #[serde(default)]
    pub default: Option<Value>,
}

impl ParamSpec {
    /// Convierte `value` al tipo declarado. Strings numéricos se aceptan.
    pub fn coerce(&self, name: &str, value: &Value) -> Result<Value, DomainError> {
        let invalid = || DomainError::ValidationError(format!("parameter '{name}' is not a valid {:?}: {value}", self.kind));
        match (self.kind, value) {
            (_, Value::Null) => Ok(Value::Null),
            (ParamKind::Integer, Value::Number(n)) if n.is_i64() || n.is_u64() => Ok(value.clone()),
            (ParamKind::Integer, Value::Number(n)) => n.as_f64()
                                                       .filter(|f| f.fract() == 0.0)
                                                       .map(|f| Value::from(f as i64))
                                                       .ok_or_else(invalid),
            (ParamKind::Integer, Value::String(s)) => s.trim().parse::<i64>().map(Value::from).map_err(|_| invalid()),
            (ParamKind::Number, Value::Number(_)) => Ok(value.clone()),
            (ParamKind::Number, Value::String(s)) => s.trim()
                                                      .parse::<f64>()
                                                      .ok()
                                                      .and_then(serde_json::Number::from_f64)
                                                      .map(Value::Number)
                                                      .ok_or_else(invalid),
            (ParamKind::Boolean, Value::Bool(_)) => Ok(value.clone()),
            (ParamKind::Boolean, Value::String(s)) => match s.trim() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(invalid()),
            },
            (ParamKind::String, Value::String(_)) => Ok(value.clone()),
            (ParamKind::String, Value::Number(n)) => Ok(Value::String(n.to_string())),
            (ParamKind::String, Value::Bool(b)) => Ok(Value::String(b.to_string())),
            _ => Err(invalid()),
        }
    }
}

/// Límite de runtime: segundos fijos o fórmula sobre `SAMPLE_COUNT`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuntimeLimit {
    Seconds(u64),
    Formula(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineSettings {
    #[serde(default)]
    pub min_runtime: Option<RuntimeLimit>,
    #[serde(default)]
    pub max_runtime: Option<RuntimeLimit>,
    /// Intervalo entre polls de estado, en segundos.
    #[serde(default)]
    pub status_check_interval: Option<u64>,
}

/// Descriptor del motor remoto usado al construir el run request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineDescriptor {
    pub workflow_type: String,
    pub workflow_type_version: String,
    pub workflow_engine: String,
    pub workflow_engine_version: String,
}

impl Default for EngineDescriptor {
    fn default() -> Self {
        Self { workflow_type: "NFL".into(),
               workflow_type_version: "DSL2".into(),
               workflow_engine: "nextflow".into(),
               workflow_engine_version: "23.10.0".into() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,
    pub version: String,
    pub url: String,
    /// Orden literal de columnas del samplesheet.
    pub samplesheet_headers: Vec<String>,
    #[serde(default)]
    pub parameters: IndexMap<String, ParamSpec>,
    #[serde(default)]
    pub settings: PipelineSettings,
    #[serde(default)]
    pub engine: EngineDescriptor,
}

impl PipelineDefinition {
    pub fn workflow_ref(&self) -> WorkflowRef {
        WorkflowRef::new(self.name.clone(), self.version.clone())
    }

    /// Parámetros con default declarado, en el orden del esquema.
    pub fn default_params(&self) -> IndexMap<String, Value> {
        self.parameters
            .iter()
            .filter_map(|(k, spec)| spec.default.clone().map(|d| (k.clone(), d)))
            .collect()
    }

    /// Aplica la coerción del esquema sobre `params`. Claves fuera del esquema
    /// se dejan intactas.
    pub fn coerce_params(&self, params: &IndexMap<String, Value>) -> Result<IndexMap<String, Value>, DomainError> {
        params.iter()
              .map(|(k, v)| match self.parameters.get(k) {
                  Some(spec) => spec.coerce(k, v).map(|c| (k.clone(), c)),
                  None => Ok((k.clone(), v.clone())),
              })
              .collect()
    }
}
