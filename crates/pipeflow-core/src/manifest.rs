//! Manifest de salida escrito por el run remoto.
//!
//! Formato (contrato de cable, no se puede cambiar):
//!
//! ```json
//! {
//!   "files":    { "global": [{"path": "..."}], "samples": {"<id>": [{"path": "..."}]} },
//!   "metadata": { "samples": {"<id>": { ...json anidado... }} }
//! }
//! ```
//!
//! comprimido con gzip. La metadata anidada se aplana a claves con puntos
//! antes de guardarse.
use std::io::Read;

use flate2::read::GzDecoder;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::OrchestrationError;

/// Tope de bytes descomprimidos para rechazar compression bombs.
pub const MAX_DECOMPRESSED_SIZE: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestFiles {
    #[serde(default)]
    pub global: Vec<ManifestFile>,
    #[serde(default)]
    pub samples: IndexMap<String, Vec<ManifestFile>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestMetadata {
    #[serde(default)]
    pub samples: IndexMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputManifest {
    #[serde(default)]
    pub files: ManifestFiles,
    #[serde(default)]
    pub metadata: ManifestMetadata,
}

impl OutputManifest {
    /// Descomprime y parsea el manifest.
    pub fn from_gzip(bytes: &[u8]) -> Result<Self, OrchestrationError> {
        let json = gunzip_bounded(bytes, MAX_DECOMPRESSED_SIZE)?;
        serde_json::from_slice(&json).map_err(|e| OrchestrationError::Manifest(format!("invalid manifest json: {e}")))
    }

    pub fn sample_files(&self, sample_id: &str) -> &[ManifestFile] {
        self.files.samples.get(sample_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Metadata aplanada de una muestra; vacía si no hay entrada.
    pub fn sample_metadata(&self, sample_id: &str) -> IndexMap<String, Value> {
        self.metadata.samples.get(sample_id).map(flatten).unwrap_or_default()
    }
}

fn gunzip_bounded(bytes: &[u8], limit: usize) -> Result<Vec<u8>, OrchestrationError> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    let mut buffer = [0u8; 8192];
    loop {
        let n = decoder.read(&mut buffer)
                       .map_err(|e| OrchestrationError::Manifest(format!("gzip decode failed: {e}")))?;
        if n == 0 {
            break;
        }
        if out.len() + n > limit {
            return Err(OrchestrationError::Manifest(format!("manifest exceeds {limit} bytes once decompressed")));
        }
        out.extend_from_slice(&buffer[..n]);
    }
    Ok(out)
}

/// Aplana objetos anidados a claves `a.b.c`. Arrays y escalares son hojas.
pub fn flatten(value: &Value) -> IndexMap<String, Value> {
    let mut out = IndexMap::new();
    if let Value::Object(map) = value {
        flatten_into(map, None, &mut out);
    }
    out
}

fn flatten_into(map: &Map<String, Value>, prefix: Option<&str>, out: &mut IndexMap<String, Value>) {
    for (k, v) in map {
        let key = match prefix {
            Some(p) => format!("{p}.{k}"),
            None => k.clone(),
        };
        match v {
            Value::Object(inner) => flatten_into(inner, Some(&key), out),
            leaf => {
                out.insert(key, leaf.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use serde_json::json;
    use std::io::Write;

    fn gzip(v: &Value) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(v.to_string().as_bytes()).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn parses_and_flattens() {
        let bytes = gzip(&json!({
            "files": {"global": [{"path": "a.txt"}], "samples": {"S1": [{"path": "b.txt"}]}},
            "metadata": {"samples": {"S1": {"qc": {"score": 9}, "organism": "E. coli"}}}
        }));
        let m = OutputManifest::from_gzip(&bytes).unwrap();
        assert_eq!(m.files.global, vec![ManifestFile { path: "a.txt".into() }]);
        assert_eq!(m.sample_files("S1").len(), 1);
        assert!(m.sample_files("S2").is_empty());
        let md = m.sample_metadata("S1");
        assert_eq!(md.get("qc.score"), Some(&json!(9)));
        assert_eq!(md.get("organism"), Some(&json!("E. coli")));
    }

    #[test]
    fn missing_sections_default_to_empty() {
        let m = OutputManifest::from_gzip(&gzip(&json!({}))).unwrap();
        assert!(m.files.global.is_empty());
        assert!(m.sample_metadata("S1").is_empty());
    }

    #[test]
    fn rejects_non_gzip_and_bad_json() {
        assert!(matches!(OutputManifest::from_gzip(b"{}"), Err(OrchestrationError::Manifest(_))));
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"not json").unwrap();
        assert!(matches!(OutputManifest::from_gzip(&enc.finish().unwrap()), Err(OrchestrationError::Manifest(_))));
    }

    #[test]
    fn enforces_decompressed_limit() {
        let bytes = gzip(&json!({"files": {"global": []}, "pad": "x".repeat(4096)}));
        assert!(matches!(gunzip_bounded(&bytes, 1024), Err(OrchestrationError::Manifest(_))));
    }

    #[test]
    fn flatten_keeps_arrays_as_leaves() {
        let f = flatten(&json!({"a": {"b": [1, 2], "c": {"d": null}}}));
        assert_eq!(f.get("a.b"), Some(&json!([1, 2])));
        assert_eq!(f.get("a.c.d"), Some(&Value::Null));
    }
}
