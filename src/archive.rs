//! Cold storage for key versions evicted from the resident ring

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::keyring::KeyVersionEntry;
use crate::storage::KeyValueStore;

/// Storage key prefix of archive records
pub const ARCHIVE_PREFIX: &str = "archive/";

/// Every key version of one policy, addressed by version number.
///
/// Versions up to the committed watermark are write-once. Versions above it
/// can only come from a write whose policy record was never committed, so
/// they are replaced freely.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Archive {
    keys: BTreeMap<u32, KeyVersionEntry>,
}

impl Archive {
    pub fn storage_key(name: &str) -> String {
        format!("{}{}", ARCHIVE_PREFIX, name)
    }

    /// Load the archive of `name`; a missing record is an empty archive
    pub fn load<S: KeyValueStore + ?Sized>(storage: &S, name: &str) -> Result<Self> {
        match storage.get(&Self::storage_key(name))? {
            Some(bytes) => {
                let archive: Archive = serde_json::from_slice(&bytes)?;
                debug!(policy = %name, versions = archive.keys.len(), "loaded key archive");
                Ok(archive)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn save<S: KeyValueStore + ?Sized>(&self, storage: &S, name: &str) -> Result<()> {
        storage.put(&Self::storage_key(name), serde_json::to_vec(self)?)
    }

    pub fn delete<S: KeyValueStore + ?Sized>(storage: &S, name: &str) -> Result<()> {
        storage.delete(&Self::storage_key(name))
    }

    /// Record `entry` unless a committed copy of that version already exists.
    /// Returns whether the archive changed.
    pub fn record(&mut self, entry: &KeyVersionEntry, committed: u32) -> bool {
        if entry.version <= committed && self.keys.contains_key(&entry.version) {
            return false;
        }
        self.keys.insert(entry.version, entry.clone());
        true
    }

    pub fn get(&self, version: u32) -> Option<&KeyVersionEntry> {
        self.keys.get(&version)
    }

    /// Take ownership of one version, consuming the archive
    pub fn into_entry(mut self, version: u32) -> Option<KeyVersionEntry> {
        self.keys.remove(&version)
    }

    pub fn latest_version(&self) -> u32 {
        self.keys.keys().next_back().copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
