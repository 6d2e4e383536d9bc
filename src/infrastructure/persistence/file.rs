//! JSON file backed key-value store
//!
//! Reads and writes hit an in-memory map. `apply` writes the whole map to a
//! temporary file and renames it over the target, so a crash mid-write
//! leaves the previous snapshot intact.

use crate::domain::call::repository::{KeyValueStore, StoredValue};
use crate::domain::shared::error::DomainError;
use crate::domain::shared::result::Result;
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

pub struct FileKeyValueStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, StoredValue>>,
}

impl FileKeyValueStore {
    /// Open the store at `path`, loading any existing snapshot
    ///
    /// A missing file starts empty. An unreadable snapshot is discarded with
    /// a warning rather than failing startup.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let values = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(values) => values,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "discarding corrupt store snapshot");
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(DomainError::Storage(format!(
                    "read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        debug!(path = %path.display(), entries = values.len(), "key-value store opened");
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn values(&self) -> MutexGuard<'_, BTreeMap<String, StoredValue>> {
        self.values.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl KeyValueStore for FileKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<StoredValue>> {
        Ok(self.values().get(key).cloned())
    }

    fn put(&self, key: &str, value: StoredValue) -> Result<()> {
        self.values().insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.values().remove(key);
        Ok(())
    }

    fn apply(&self) -> Result<()> {
        let bytes = {
            let values = self.values();
            serde_json::to_vec_pretty(&*values)
                .map_err(|e| DomainError::Storage(format!("encode: {}", e)))?
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| DomainError::Storage(format!("create {}: {}", parent.display(), e)))?;
        }

        let temp = self.temp_path();
        fs::write(&temp, bytes)
            .map_err(|e| DomainError::Storage(format!("write {}: {}", temp.display(), e)))?;
        fs::rename(&temp, &self.path)
            .map_err(|e| DomainError::Storage(format!("rename {}: {}", self.path.display(), e)))?;
        Ok(())
    }
}
