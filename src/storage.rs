//! Storage abstraction for persisted policies
//!
//! The engine treats persistence as a plain key-value byte store. Backends
//! implement [`KeyValueStore`]; [`InMemoryStorage`] is provided for tests and
//! single-process deployments.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::error::Result;

/// Storage trait for the policy backend
pub trait KeyValueStore: Send + Sync {
    /// Retrieve the value stored under `key`
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Durably store `value` under `key`, replacing any previous value
    fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Remove `key`. Removing an absent key is not an error.
    fn delete(&self, key: &str) -> Result<()>;

    /// List all keys starting with `prefix`
    fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// In-memory implementation of KeyValueStore
///
/// Data is lost when the process terminates.
pub struct InMemoryStorage {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for InMemoryStorage {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let entries = self.entries.read();
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}
