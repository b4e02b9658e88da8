//! Blob Store sobre un directorio local.
//!
//! Cada blob es un archivo en `{root}/{key}`; su `BlobRef` (nombre original,
//! tamaño, checksum) se guarda aparte en `{root}/.meta/{key}.json` para que
//! `copy_with_key` conserve el nombre de archivo de la fuente.
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use pipeflow_core::storage::{checksum, content_key, filename_of, StorageBackend};
use pipeflow_core::{BlobStore, OrchestrationError};
use pipeflow_domain::BlobRef;

const META_DIR: &str = ".meta";

pub struct LocalFsBlobStore {
    root: PathBuf,
    backend: StorageBackend,
}

fn io_error(key: &str, e: io::Error) -> OrchestrationError {
    match e.kind() {
        io::ErrorKind::NotFound => OrchestrationError::NotFound(format!("blob {key}")),
        _ => OrchestrationError::Staging(format!("{key}: {e}")),
    }
}

fn valid_key(key: &str) -> Result<&str, OrchestrationError> {
    let key = key.trim_start_matches('/');
    if key.is_empty() || key.split('/').any(|s| s == ".." || s == META_DIR) {
        return Err(OrchestrationError::Validation(format!("invalid blob key {key:?}")));
    }
    Ok(key)
}

impl LocalFsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, OrchestrationError> {
        let root = root.into();
        fs::create_dir_all(root.join(META_DIR)).map_err(|e| io_error(&root.to_string_lossy(), e))?;
        Ok(Self { backend: StorageBackend::Local { root: root.clone() },
                  root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn data_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.root.join(META_DIR).join(format!("{key}.json"))
    }

    fn write(&self, key: &str, bytes: &[u8], filename: &str) -> Result<BlobRef, OrchestrationError> {
        let key = valid_key(key)?;
        let blob = BlobRef { key: key.to_string(),
                             filename: filename.to_string(),
                             byte_size: bytes.len() as u64,
                             checksum: checksum(bytes) };
        let data = self.data_path(key);
        let meta = self.meta_path(key);
        for path in [&data, &meta] {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|e| io_error(key, e))?;
            }
        }
        fs::write(&data, bytes).map_err(|e| io_error(key, e))?;
        let json = serde_json::to_vec(&blob).map_err(|e| OrchestrationError::Staging(e.to_string()))?;
        fs::write(&meta, json).map_err(|e| io_error(key, e))?;
        log::debug!("blob written key={key} bytes={}", blob.byte_size);
        Ok(blob)
    }

    fn read_meta(&self, key: &str) -> Option<BlobRef> {
        let bytes = fs::read(self.meta_path(key)).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Claves de todos los blobs bajo `prefix`, ordenadas.
    pub fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, OrchestrationError> {
        let mut keys = Vec::new();
        collect_keys(&self.root, &self.root, &mut keys).map_err(|e| io_error(prefix, e))?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }
}

fn collect_keys(root: &Path, dir: &Path, out: &mut Vec<String>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            if dir == root && entry.file_name() == META_DIR {
                continue;
            }
            collect_keys(root, &path, out)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            let key = rel.components()
                         .map(|c| c.as_os_str().to_string_lossy().into_owned())
                         .collect::<Vec<_>>()
                         .join("/");
            out.push(key);
        }
    }
    Ok(())
}

impl BlobStore for LocalFsBlobStore {
    fn put(&self, bytes: &[u8], filename: &str) -> Result<BlobRef, OrchestrationError> {
        self.write(&content_key(bytes), bytes, filename)
    }

    fn put_with_key(&self, key: &str, bytes: &[u8], filename: &str) -> Result<BlobRef, OrchestrationError> {
        self.write(key, bytes, filename)
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, OrchestrationError> {
        let key = valid_key(key)?;
        fs::read(self.data_path(key)).map_err(|e| io_error(key, e))
    }

    fn exists(&self, key: &str) -> Result<bool, OrchestrationError> {
        let key = valid_key(key)?;
        Ok(self.data_path(key).is_file())
    }

    fn copy_with_key(&self, source_key: &str, new_key: &str) -> Result<BlobRef, OrchestrationError> {
        let bytes = self.get(source_key)?;
        let filename = self.read_meta(source_key)
                           .map(|m| m.filename)
                           .unwrap_or_else(|| filename_of(source_key).to_string());
        self.write(new_key, &bytes, &filename)
    }

    fn resolve_uri(&self, key: &str) -> String {
        self.backend.render_uri(key)
    }

    fn delete_prefix(&self, prefix: &str) -> Result<usize, OrchestrationError> {
        let keys = self.keys_with_prefix(prefix)?;
        for key in &keys {
            fs::remove_file(self.data_path(key)).map_err(|e| io_error(key, e))?;
            // metadata huérfana no afecta lecturas
            let _ = fs::remove_file(self.meta_path(key));
        }
        log::debug!("blobs deleted prefix={prefix} count={}", keys.len());
        Ok(keys.len())
    }
}
