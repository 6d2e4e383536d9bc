//! Durable key-value storage port

use crate::domain::shared::result::Result;
use serde::{Deserialize, Serialize};

/// A single stored value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum StoredValue {
    String(String),
    Int(i32),
    Long(i64),
    Bool(bool),
}

/// Simple preferences-style storage
///
/// This is defined in the domain layer as a trait (port),
/// and implemented in the infrastructure layer (adapter).
/// Writes become durable on [`KeyValueStore::apply`]; there are no
/// transactions.
#[cfg_attr(test, mockall::automock)]
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<StoredValue>>;

    fn put(&self, key: &str, value: StoredValue) -> Result<()>;

    fn remove(&self, key: &str) -> Result<()>;

    /// Flush pending writes
    fn apply(&self) -> Result<()>;
}

/// Typed reads over [`KeyValueStore`]
///
/// A value stored under a different type reads as absent.
pub trait KeyValueStoreExt: KeyValueStore {
    fn get_string(&self, key: &str) -> Result<Option<String>> {
        Ok(match self.get(key)? {
            Some(StoredValue::String(s)) => Some(s),
            _ => None,
        })
    }

    fn get_long(&self, key: &str) -> Result<Option<i64>> {
        Ok(match self.get(key)? {
            Some(StoredValue::Long(v)) => Some(v),
            Some(StoredValue::Int(v)) => Some(v as i64),
            _ => None,
        })
    }

    fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        Ok(match self.get(key)? {
            Some(StoredValue::Bool(v)) => Some(v),
            _ => None,
        })
    }
}

impl<T: KeyValueStore + ?Sized> KeyValueStoreExt for T {}
