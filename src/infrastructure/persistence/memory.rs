//! In-memory key-value store

use crate::domain::call::repository::{KeyValueStore, StoredValue};
use crate::domain::shared::result::Result;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Non-durable [`KeyValueStore`]; `apply` is a no-op
#[derive(Default)]
pub struct MemoryKeyValueStore {
    values: Mutex<HashMap<String, StoredValue>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn values(&self) -> MutexGuard<'_, HashMap<String, StoredValue>> {
        self.values.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.values().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values().is_empty()
    }
}

impl KeyValueStore for MemoryKeyValueStore {
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
        Ok(())
    }
}
