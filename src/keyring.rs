//! Versioned key material of a single policy

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::{RandomSource, SecureKey, AES_256_KEY_SIZE};
use crate::error::{Result, TransitError};

/// One generation of key material. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyVersionEntry {
    pub version: u32,
    pub key: SecureKey,
    /// Secondary secret used for convergent nonce derivation. Absent on
    /// versions migrated from the single-key form until upgraded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmac_key: Option<SecureKey>,
    pub creation_time: DateTime<Utc>,
}

impl KeyVersionEntry {
    /// Generate fresh key and HMAC material for `version`
    pub fn generate(version: u32, random: &dyn RandomSource) -> Result<Self> {
        Ok(Self {
            version,
            key: SecureKey::generate(random, AES_256_KEY_SIZE)?,
            hmac_key: Some(SecureKey::generate(random, AES_256_KEY_SIZE)?),
            creation_time: Utc::now(),
        })
    }
}

/// Resident key versions of a policy, ordered by version number.
///
/// Versions are appended one at a time and never renumbered. Older versions
/// may be evicted to the archive; the newest version is always resident.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyRing {
    entries: BTreeMap<u32, KeyVersionEntry>,
}

impl KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Newest resident version, 0 when empty
    pub fn latest_version(&self) -> u32 {
        self.entries.keys().next_back().copied().unwrap_or(0)
    }

    /// Oldest resident version, if any
    pub fn oldest_version(&self) -> Option<u32> {
        self.entries.keys().next().copied()
    }

    /// Append `entry`, which must carry exactly `latest_version + 1`
    pub fn add_version(&mut self, entry: KeyVersionEntry) -> Result<u32> {
        let expected = self.latest_version() + 1;
        if entry.version != expected {
            return Err(TransitError::Conflict(format!(
                "key version {} cannot follow version {}",
                entry.version,
                expected - 1
            )));
        }
        self.entries.insert(entry.version, entry);
        Ok(expected)
    }

    /// Resident entry for `version`; `None` when it was never created or has
    /// been evicted to the archive.
    pub fn get(&self, version: u32) -> Option<&KeyVersionEntry> {
        self.entries.get(&version)
    }

    pub fn get_mut(&mut self, version: u32) -> Option<&mut KeyVersionEntry> {
        self.entries.get_mut(&version)
    }

    /// One-time conversion of the pre-versioning single-key form.
    ///
    /// Returns `false` without touching anything if the ring already holds
    /// versions.
    pub fn migrate_legacy(&mut self, key: SecureKey, creation_time: DateTime<Utc>) -> bool {
        if !self.entries.is_empty() {
            return false;
        }
        self.entries.insert(
            1,
            KeyVersionEntry {
                version: 1,
                key,
                hmac_key: None,
                creation_time,
            },
        );
        true
    }

    /// Remove every version below `version`, returning how many were dropped.
    /// The newest version is never removed.
    pub fn evict_below(&mut self, version: u32) -> usize {
        let floor = version.min(self.latest_version());
        let retained = self.entries.split_off(&floor);
        let evicted = self.entries.len();
        self.entries = retained;
        evicted
    }

    pub fn iter(&self) -> impl Iterator<Item = &KeyVersionEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
