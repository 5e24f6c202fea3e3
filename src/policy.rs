//! Named key policies: configuration plus versioned key material
//!
//! A [`Policy`] owns its [`KeyRing`] and knows how to encrypt, decrypt,
//! rewrap, rotate and reconfigure itself. It never touches storage except to
//! read archived key versions; persistence is the store's job.

use std::borrow::Cow;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use zeroize::Zeroize;

use crate::archive::Archive;
use crate::crypto::{
    generate_random_bytes, AesGcmCipher, RandomSource, SecureKey, AES_256_KEY_SIZE, NONCE_SIZE,
};
use crate::envelope::CiphertextEnvelope;
use crate::error::{Result, TransitError};
use crate::kdf::{self, Kdf};
use crate::keyring::{KeyRing, KeyVersionEntry};
use crate::storage::KeyValueStore;

/// Storage key prefix of primary policy records
pub const POLICY_PREFIX: &str = "policy/";

/// First convergent version whose nonce is derived instead of supplied
pub const DERIVED_NONCE_CONVERGENT_VERSION: u32 = 2;

/// Cipher suite of a policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyType {
    #[default]
    #[serde(rename = "aes256-gcm96")]
    Aes256Gcm96,
}

impl std::fmt::Display for KeyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyType::Aes256Gcm96 => write!(f, "aes256-gcm96"),
        }
    }
}

/// How the AEAD nonce is chosen for an encryption
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceMode {
    /// Fresh random nonce per call
    Random,
    /// Legacy convergent: the caller supplies the nonce
    Supplied,
    /// Convergent v2+: derived from version, context and plaintext
    Derived,
}

/// Settings for a new policy
#[derive(Debug, Clone, Default)]
pub struct PolicyOptions {
    pub derived: bool,
    /// Defaults to HKDF-SHA256
    pub kdf: Option<Kdf>,
    pub convergent_encryption: bool,
    pub exportable: bool,
}

/// Partial configuration update; `None` leaves a setting unchanged
#[derive(Debug, Clone, Default)]
pub struct ConfigUpdate {
    pub min_decryption_version: Option<u32>,
    pub min_encryption_version: Option<u32>,
    pub deletion_allowed: Option<bool>,
    pub exportable: Option<bool>,
}

/// Read-side view of a policy. Never carries key material.
#[derive(Debug, Clone, Serialize)]
pub struct PolicyInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub key_type: KeyType,
    pub derived: bool,
    pub kdf: Kdf,
    pub deletion_allowed: bool,
    pub convergent_encryption: bool,
    pub convergent_version: u32,
    pub exportable: bool,
    /// Creation time of every decryptable version
    pub versions: BTreeMap<u32, DateTime<Utc>>,
    pub latest_version: u32,
    pub min_decryption_version: u32,
    pub min_encryption_version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub(crate) name: String,
    #[serde(rename = "type", default)]
    pub(crate) key_type: KeyType,
    #[serde(default)]
    pub(crate) derived: bool,
    /// `None` only on records written before the KDF was persisted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) kdf: Option<Kdf>,
    #[serde(default)]
    pub(crate) convergent_encryption: bool,
    #[serde(default)]
    pub(crate) convergent_version: u32,
    #[serde(default)]
    pub(crate) exportable: bool,
    #[serde(default)]
    pub(crate) deletion_allowed: bool,
    #[serde(default)]
    pub(crate) min_decryption_version: u32,
    #[serde(default)]
    pub(crate) min_encryption_version: u32,
    #[serde(default)]
    pub(crate) latest_version: u32,
    #[serde(default)]
    pub(crate) archive_version: u32,
    #[serde(default)]
    pub(crate) keys: KeyRing,
    /// Pre-versioning single key, migrated into `keys` on upgrade
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) key: Option<SecureKey>,
}

impl Policy {
    /// An empty policy with no key versions yet
    pub fn new(name: &str, options: &PolicyOptions) -> Result<Self> {
        if name.is_empty() {
            return Err(TransitError::InvalidInput("missing policy name".into()));
        }
        if options.convergent_encryption && !options.derived {
            return Err(TransitError::InvalidInput(
                "convergent encryption requires derivation to be enabled".into(),
            ));
        }

        Ok(Self {
            name: name.to_string(),
            key_type: KeyType::Aes256Gcm96,
            derived: options.derived,
            kdf: Some(options.kdf.unwrap_or(Kdf::HkdfSha256)),
            convergent_encryption: options.convergent_encryption,
            convergent_version: if options.convergent_encryption {
                DERIVED_NONCE_CONVERGENT_VERSION
            } else {
                0
            },
            exportable: options.exportable,
            deletion_allowed: false,
            min_decryption_version: 1,
            min_encryption_version: 0,
            latest_version: 0,
            archive_version: 0,
            keys: KeyRing::new(),
            key: None,
        })
    }

    /// A new policy holding freshly generated version 1
    pub fn create(name: &str, options: &PolicyOptions, random: &dyn RandomSource) -> Result<Self> {
        let mut policy = Self::new(name, options)?;
        policy.rotate(random)?;
        Ok(policy)
    }

    pub fn storage_key(name: &str) -> String {
        format!("{}{}", POLICY_PREFIX, name)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    pub fn derived(&self) -> bool {
        self.derived
    }

    /// Effective KDF; an unpersisted KDF predates HKDF support
    pub fn kdf(&self) -> Kdf {
        self.kdf.unwrap_or(Kdf::HmacSha256Counter)
    }

    pub fn convergent_encryption(&self) -> bool {
        self.convergent_encryption
    }

    pub fn convergent_version(&self) -> u32 {
        self.convergent_version
    }

    pub fn exportable(&self) -> bool {
        self.exportable
    }

    pub fn deletion_allowed(&self) -> bool {
        self.deletion_allowed
    }

    pub fn latest_version(&self) -> u32 {
        self.latest_version
    }

    pub fn min_decryption_version(&self) -> u32 {
        self.min_decryption_version
    }

    pub fn min_encryption_version(&self) -> u32 {
        self.min_encryption_version
    }

    pub fn archive_version(&self) -> u32 {
        self.archive_version
    }

    pub fn keys(&self) -> &KeyRing {
        &self.keys
    }

    /// Version used for new ciphertexts
    pub fn encryption_version(&self) -> u32 {
        if self.min_encryption_version > 0 {
            self.min_encryption_version
        } else {
            self.latest_version
        }
    }

    pub fn nonce_mode(&self) -> NonceMode {
        if !self.convergent_encryption {
            NonceMode::Random
        } else if self.convergent_version < DERIVED_NONCE_CONVERGENT_VERSION {
            NonceMode::Supplied
        } else {
            NonceMode::Derived
        }
    }

    /// Append a freshly generated key version and make it the latest
    pub fn rotate(&mut self, random: &dyn RandomSource) -> Result<u32> {
        let entry = KeyVersionEntry::generate(self.latest_version + 1, random)?;
        self.latest_version = self.keys.add_version(entry)?;
        Ok(self.latest_version)
    }

    pub fn set_min_decryption_version(&mut self, version: u32) -> Result<()> {
        if version < 1 || version > self.latest_version {
            return Err(TransitError::InvalidInput(format!(
                "min_decryption_version must be between 1 and {}, got {}",
                self.latest_version, version
            )));
        }
        if self.min_encryption_version > 0 && self.min_encryption_version < version {
            return Err(TransitError::InvalidInput(format!(
                "min_decryption_version {} would exceed min_encryption_version {}",
                version, self.min_encryption_version
            )));
        }
        self.min_decryption_version = version;
        Ok(())
    }

    /// 0 means always use the latest version
    pub fn set_min_encryption_version(&mut self, version: u32) -> Result<()> {
        if version != 0
            && (version < self.min_decryption_version || version > self.latest_version)
        {
            return Err(TransitError::InvalidInput(format!(
                "min_encryption_version must be 0 or between {} and {}, got {}",
                self.min_decryption_version, self.latest_version, version
            )));
        }
        self.min_encryption_version = version;
        Ok(())
    }

    /// Apply a configuration update; validation failures leave `self` unchanged
    pub fn apply_config(&mut self, update: &ConfigUpdate) -> Result<()> {
        let mut next = self.clone();

        if let Some(exportable) = update.exportable {
            if next.exportable && !exportable {
                return Err(TransitError::Conflict(
                    "exportable cannot be disabled once enabled".into(),
                ));
            }
            next.exportable = exportable;
        }
        if let Some(allowed) = update.deletion_allowed {
            next.deletion_allowed = allowed;
        }

        // Lowering min_encryption first lets both bounds move up together.
        match (update.min_decryption_version, update.min_encryption_version) {
            (Some(dec), Some(enc)) => {
                next.min_encryption_version = 0;
                next.set_min_decryption_version(dec)?;
                next.set_min_encryption_version(enc)?;
            }
            (Some(dec), None) => next.set_min_decryption_version(dec)?,
            (None, Some(enc)) => next.set_min_encryption_version(enc)?,
            (None, None) => {}
        }

        *self = next;
        Ok(())
    }

    /// Reject settings in a create request that differ from this policy
    pub fn check_compatible(&self, options: &PolicyOptions) -> Result<()> {
        if options.convergent_encryption && !options.derived {
            return Err(TransitError::InvalidInput(
                "convergent encryption requires derivation to be enabled".into(),
            ));
        }
        if options.derived != self.derived {
            return Err(TransitError::Conflict(format!(
                "policy '{}' already exists with derived={}",
                self.name, self.derived
            )));
        }
        if options.convergent_encryption != self.convergent_encryption {
            return Err(TransitError::Conflict(format!(
                "policy '{}' already exists with convergent_encryption={}",
                self.name, self.convergent_encryption
            )));
        }
        if let Some(kdf) = options.kdf {
            if self.derived && kdf != self.kdf() {
                return Err(TransitError::Conflict(format!(
                    "policy '{}' already exists with kdf={}",
                    self.name,
                    self.kdf()
                )));
            }
        }
        Ok(())
    }

    /// Key version entry, from the resident ring or rehydrated from the archive
    pub fn key_entry<S: KeyValueStore + ?Sized>(
        &self,
        storage: &S,
        version: u32,
    ) -> Result<Cow<'_, KeyVersionEntry>> {
        if version < self.min_decryption_version {
            return Err(TransitError::TooOld {
                version,
                min: self.min_decryption_version,
            });
        }
        if version > self.latest_version {
            return Err(TransitError::InvalidInput(format!(
                "invalid key version {}",
                version
            )));
        }
        if let Some(entry) = self.keys.get(version) {
            return Ok(Cow::Borrowed(entry));
        }
        if version <= self.archive_version {
            debug!(policy = %self.name, version, "rehydrating key version from archive");
            if let Some(entry) = Archive::load(storage, &self.name)?.into_entry(version) {
                return Ok(Cow::Owned(entry));
            }
        }
        Err(TransitError::NotFound(format!(
            "key version {} of policy '{}'",
            version, self.name
        )))
    }

    fn encryption_key(&self, entry: &KeyVersionEntry, context: Option<&[u8]>) -> Result<SecureKey> {
        if !self.derived {
            return Ok(entry.key.clone());
        }
        let context = context.ok_or_else(|| {
            TransitError::InvalidInput(
                "missing 'context' for key derivation; the policy uses derived keys".into(),
            )
        })?;
        kdf::derive_key(self.kdf(), &entry.key, context)
    }

    /// Encrypt `plaintext` (possibly empty) into an envelope string
    pub fn encrypt<S: KeyValueStore + ?Sized>(
        &self,
        storage: &S,
        random: &dyn RandomSource,
        plaintext: &[u8],
        context: Option<&[u8]>,
        nonce: Option<&[u8]>,
    ) -> Result<String> {
        let version = self.encryption_version();
        let entry = self.key_entry(storage, version)?;
        let key = self.encryption_key(&entry, context)?;

        let nonce = match self.nonce_mode() {
            NonceMode::Random => {
                if nonce.is_some() {
                    return Err(TransitError::InvalidInput(
                        "a nonce may only be supplied for convergent encryption".into(),
                    ));
                }
                generate_random_bytes(random, NONCE_SIZE)?
            }
            NonceMode::Supplied => {
                let nonce = nonce.ok_or_else(|| {
                    TransitError::InvalidInput(
                        "missing 'nonce' for convergent encryption".into(),
                    )
                })?;
                if nonce.len() != NONCE_SIZE {
                    return Err(TransitError::InvalidInput(format!(
                        "invalid nonce length: expected {}, got {}",
                        NONCE_SIZE,
                        nonce.len()
                    )));
                }
                nonce.to_vec()
            }
            NonceMode::Derived => {
                if nonce.is_some() {
                    return Err(TransitError::InvalidInput(
                        "a nonce must not be supplied; it is derived from the context".into(),
                    ));
                }
                kdf::convergent_nonce(
                    entry.hmac_key.as_ref(),
                    &key,
                    version,
                    context.unwrap_or_default(),
                    plaintext,
                )?
                .to_vec()
            }
        };

        let encrypted = AesGcmCipher::encrypt(&key, &nonce, plaintext, context)?;
        Ok(CiphertextEnvelope::new(version, encrypted).encode())
    }

    /// Decrypt an envelope produced by [`Policy::encrypt`]
    pub fn decrypt<S: KeyValueStore + ?Sized>(
        &self,
        storage: &S,
        ciphertext: &str,
        context: Option<&[u8]>,
    ) -> Result<Vec<u8>> {
        // Version checks happen before any cryptographic work.
        let version = CiphertextEnvelope::parse_version(ciphertext)?;
        if version < self.min_decryption_version {
            return Err(TransitError::TooOld {
                version,
                min: self.min_decryption_version,
            });
        }
        let envelope = CiphertextEnvelope::parse(ciphertext)?;

        let entry = self.key_entry(storage, envelope.version)?;
        let key = self.encryption_key(&entry, context)?;
        AesGcmCipher::decrypt(&key, &envelope.encrypted_data, context)
    }

    /// Decrypt with whatever version produced `ciphertext` and re-encrypt
    /// under the current encryption version
    pub fn rewrap<S: KeyValueStore + ?Sized>(
        &self,
        storage: &S,
        random: &dyn RandomSource,
        ciphertext: &str,
        context: Option<&[u8]>,
        nonce: Option<&[u8]>,
    ) -> Result<String> {
        let mut plaintext = self.decrypt(storage, ciphertext, context)?;
        let result = self.encrypt(storage, random, &plaintext, context, nonce);
        plaintext.zeroize();
        result
    }

    /// Move the legacy single key into the ring as version 1
    pub fn migrate_legacy(&mut self) -> bool {
        let Some(key) = self.key.take() else {
            return false;
        };
        let migrated = self.keys.migrate_legacy(key, Utc::now());
        if self.latest_version == 0 {
            self.latest_version = self.keys.latest_version();
        }
        migrated
    }

    /// Whether this record predates the current persisted form
    pub fn needs_upgrade(&self) -> bool {
        if self.key.as_ref().is_some_and(|k| !k.is_empty()) {
            return true;
        }
        if self.latest_version == 0 && !self.keys.is_empty() {
            return true;
        }
        if self.min_decryption_version == 0 {
            return true;
        }
        if self.convergent_encryption && self.convergent_version == 0 {
            return true;
        }
        if self.kdf.is_none() {
            return true;
        }
        self.latest_version > self.archive_version
            && self
                .keys
                .get(self.latest_version)
                .is_some_and(|entry| entry.hmac_key.is_none())
    }

    /// Bring an old record up to date in place. Never changes which keys
    /// decrypt existing ciphertexts.
    pub fn upgrade(&mut self, random: &dyn RandomSource) -> Result<()> {
        if self.migrate_legacy() {
            warn!(policy = %self.name, "migrated legacy single-key policy to version 1");
        }
        if self.latest_version == 0 {
            self.latest_version = self.keys.latest_version();
        }
        if self.min_decryption_version == 0 {
            self.min_decryption_version = 1;
        }
        if self.convergent_encryption && self.convergent_version == 0 {
            self.convergent_version = 1;
        }
        if self.kdf.is_none() {
            self.kdf = Some(Kdf::HmacSha256Counter);
        }
        // Archived versions are immutable, so they keep the HKDF fallback.
        let latest = self.latest_version;
        if latest > self.archive_version {
            if let Some(entry) = self.keys.get_mut(latest) {
                if entry.hmac_key.is_none() {
                    entry.hmac_key = Some(SecureKey::generate(random, AES_256_KEY_SIZE)?);
                }
            }
        }
        Ok(())
    }

    /// Drop resident versions outside the trailing window and below the
    /// minimum decryption version. Callers archive them first.
    pub fn enforce_window(&mut self, resident_versions: u32) -> usize {
        let window_floor = (self.latest_version + 1).saturating_sub(resident_versions);
        let floor = window_floor.max(self.min_decryption_version);
        self.keys.evict_below(floor)
    }

    pub fn info<S: KeyValueStore + ?Sized>(&self, storage: &S) -> Result<PolicyInfo> {
        let mut versions = BTreeMap::new();
        let mut archive: Option<Archive> = None;
        for version in self.min_decryption_version..=self.latest_version {
            if let Some(entry) = self.keys.get(version) {
                versions.insert(version, entry.creation_time);
                continue;
            }
            if archive.is_none() {
                archive = Some(Archive::load(storage, &self.name)?);
            }
            if let Some(entry) = archive.as_ref().and_then(|a| a.get(version)) {
                versions.insert(version, entry.creation_time);
            }
        }

        Ok(PolicyInfo {
            name: self.name.clone(),
            key_type: self.key_type,
            derived: self.derived,
            kdf: self.kdf(),
            deletion_allowed: self.deletion_allowed,
            convergent_encryption: self.convergent_encryption,
            convergent_version: self.convergent_version,
            exportable: self.exportable,
            versions,
            latest_version: self.latest_version,
            min_decryption_version: self.min_decryption_version,
            min_encryption_version: self.min_encryption_version,
        })
    }
}
