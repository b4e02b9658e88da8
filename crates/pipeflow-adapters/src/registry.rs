//! Registry de pipelines leído desde un archivo JSON (lista de
//! `PipelineDefinition`).
use std::fs;
use std::path::Path;

use indexmap::IndexMap;
use pipeflow_core::{OrchestrationError, PipelineRegistry};
use pipeflow_domain::{PipelineDefinition, WorkflowRef};

#[derive(Debug, Clone, Default)]
pub struct JsonPipelineRegistry {
    pipelines: IndexMap<WorkflowRef, PipelineDefinition>,
}

impl JsonPipelineRegistry {
    pub fn from_json(json: &str) -> Result<Self, OrchestrationError> {
        let defs: Vec<PipelineDefinition> =
            serde_json::from_str(json).map_err(|e| OrchestrationError::Config(format!("pipeline registry: {e}")))?;
        let mut pipelines = IndexMap::new();
        for def in defs {
            if def.samplesheet_headers.is_empty() {
                return Err(OrchestrationError::Config(format!("pipeline {}@{} declares no samplesheet headers",
                                                              def.name, def.version)));
            }
            let key = def.workflow_ref();
            if pipelines.insert(key.clone(), def).is_some() {
                return Err(OrchestrationError::Config(format!("pipeline {}@{} declared twice", key.name, key.version)));
            }
        }
        Ok(Self { pipelines })
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, OrchestrationError> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|e| OrchestrationError::Config(format!("{}: {e}", path.display())))?;
        let registry = Self::from_json(&json)?;
        log::info!("pipeline registry loaded path={} pipelines={}", path.display(), registry.len());
        Ok(registry)
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    pub fn workflows(&self) -> impl Iterator<Item = &WorkflowRef> {
        self.pipelines.keys()
    }
}

impl PipelineRegistry for JsonPipelineRegistry {
    fn find(&self, workflow: &WorkflowRef) -> Option<PipelineDefinition> {
        self.pipelines.get(workflow).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTRY: &str = r#"[
        {"name": "phac-nml/iridanextexample", "version": "1.0.2",
         "url": "https://github.com/phac-nml/iridanextexample",
         "samplesheet_headers": ["sample", "fastq_1", "fastq_2"],
         "settings": {"min_runtime": 60, "max_runtime": "SAMPLE_COUNT * 600"}},
        {"name": "phac-nml/iridanextexample", "version": "1.0.3",
         "url": "https://github.com/phac-nml/iridanextexample",
         "samplesheet_headers": ["sample", "fastq_1", "fastq_2"]}
    ]"#;

    #[test]
    fn finds_pipelines_by_name_and_version() {
        let registry = JsonPipelineRegistry::from_json(REGISTRY).unwrap();
        assert_eq!(registry.len(), 2);
        let def = registry.find(&WorkflowRef::new("phac-nml/iridanextexample", "1.0.2")).unwrap();
        assert!(def.settings.min_runtime.is_some());
        assert!(registry.find(&WorkflowRef::new("phac-nml/iridanextexample", "9.9.9")).is_none());
    }

    #[test]
    fn malformed_or_duplicate_entries_are_config_errors() {
        assert!(matches!(JsonPipelineRegistry::from_json("{"), Err(OrchestrationError::Config(_))));
        let dup = format!("[{0},{0}]",
                          r#"{"name": "p", "version": "1", "url": "u", "samplesheet_headers": ["sample"]}"#);
        assert!(matches!(JsonPipelineRegistry::from_json(&dup), Err(OrchestrationError::Config(_))));
        let no_headers = r#"[{"name": "p", "version": "1", "url": "u", "samplesheet_headers": []}]"#;
        assert!(JsonPipelineRegistry::from_json(no_headers).is_err());
    }
}
