//! Concurrency-safe registry of named policies
//!
//! Every policy name maps to one of a fixed set of reader/writer locks,
//! chosen by hashing the name. Encrypt, decrypt, rewrap, read and data-key
//! generation hold it shared; create, rotate, configuration
//! updates and delete hold it exclusively and persist before releasing it.
//! Writes are applied to a copy of the policy and only replace the cached
//! value once storage has accepted them, so a failed write leaves the engine
//! exactly as it was.
//!
//! An operation holds at most one policy lock at a time, and the cache lock
//! is only taken while a policy lock is held, never the other way round.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockWriteGuard};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::archive::Archive;
use crate::config::StoreConfig;
use crate::crypto::{OsRandom, RandomSource, SecureKey};
use crate::datakey::{self, DataKey, DataKeyRequest};
use crate::error::{Result, TransitError};
use crate::policy::{ConfigUpdate, Policy, PolicyInfo, PolicyOptions, POLICY_PREFIX};
use crate::storage::KeyValueStore;

/// Parameters of an encrypt call
#[derive(Debug, Clone, Default)]
pub struct EncryptRequest {
    /// Data to encrypt. `Some(vec![])` is a valid empty plaintext; `None` is
    /// a missing field and is rejected.
    pub plaintext: Option<Vec<u8>>,
    pub context: Option<Vec<u8>>,
    /// Only for policies in legacy convergent mode
    pub nonce: Option<Vec<u8>>,
    /// Create the policy if it does not exist yet
    pub upsert: bool,
    /// Convergent mode for a policy created by upsert
    pub convergent_encryption: bool,
}

impl EncryptRequest {
    pub fn new(plaintext: impl Into<Vec<u8>>) -> Self {
        Self {
            plaintext: Some(plaintext.into()),
            ..Default::default()
        }
    }

    pub fn with_context(mut self, context: impl Into<Vec<u8>>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_nonce(mut self, nonce: impl Into<Vec<u8>>) -> Self {
        self.nonce = Some(nonce.into());
        self
    }

    pub fn upsert(mut self) -> Self {
        self.upsert = true;
        self
    }
}

enum Lookup {
    Ready(Arc<Policy>),
    Absent,
    NeedsUpgrade,
}

/// Number of policy locks. Names hash onto them, so unrelated policies may
/// share a lock but memory stays constant however many names are seen.
pub const LOCK_STRIPES: usize = 256;

fn not_found(name: &str) -> TransitError {
    TransitError::NotFound(format!("policy '{}'", name))
}

pub struct PolicyStore<S: KeyValueStore> {
    storage: Arc<S>,
    config: StoreConfig,
    random: Arc<dyn RandomSource>,
    cache: RwLock<HashMap<String, Arc<Policy>>>,
    locks: Box<[RwLock<()>]>,
}

impl<S: KeyValueStore> PolicyStore<S> {
    pub fn new(storage: Arc<S>, config: StoreConfig) -> Result<Self> {
        Self::with_random(storage, config, Arc::new(OsRandom))
    }

    pub fn with_random(
        storage: Arc<S>,
        config: StoreConfig,
        random: Arc<dyn RandomSource>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            storage,
            config,
            random,
            cache: RwLock::new(HashMap::new()),
            locks: (0..LOCK_STRIPES).map(|_| RwLock::new(())).collect(),
        })
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Whether `name` is currently held in the in-memory cache
    pub fn is_cached(&self, name: &str) -> bool {
        self.cache.read().contains_key(name)
    }

    fn lock_index(name: &str) -> usize {
        Sha256::digest(name.as_bytes())[0] as usize % LOCK_STRIPES
    }

    fn policy_lock(&self, name: &str) -> &RwLock<()> {
        &self.locks[Self::lock_index(name)]
    }

    fn cached(&self, name: &str) -> Option<Arc<Policy>> {
        if !self.config.cache_enabled {
            return None;
        }
        self.cache.read().get(name).cloned()
    }

    fn cache_insert(&self, policy: &Arc<Policy>) {
        if self.config.cache_enabled {
            self.cache
                .write()
                .insert(policy.name().to_string(), Arc::clone(policy));
        }
    }

    fn load_record(&self, name: &str) -> Result<Option<Policy>> {
        match self.storage.get(&Policy::storage_key(name))? {
            Some(bytes) => {
                debug!(policy = %name, "loading policy from storage");
                Ok(Some(Policy::from_bytes(&bytes)?))
            }
            None => Ok(None),
        }
    }

    /// Caller holds the policy lock, shared or exclusive
    fn lookup(&self, name: &str) -> Result<Lookup> {
        if let Some(policy) = self.cached(name) {
            return Ok(Lookup::Ready(policy));
        }
        match self.load_record(name)? {
            None => Ok(Lookup::Absent),
            Some(policy) if policy.needs_upgrade() => Ok(Lookup::NeedsUpgrade),
            Some(policy) => {
                let policy = Arc::new(policy);
                self.cache_insert(&policy);
                Ok(Lookup::Ready(policy))
            }
        }
    }

    /// Caller holds the policy lock exclusively. Upgrades and persists old
    /// records before returning them.
    fn load_for_write(&self, name: &str) -> Result<Option<Arc<Policy>>> {
        if let Some(policy) = self.cached(name) {
            return Ok(Some(policy));
        }
        let Some(mut policy) = self.load_record(name)? else {
            return Ok(None);
        };
        if policy.needs_upgrade() {
            warn!(policy = %name, "upgrading persisted policy record");
            policy.upgrade(self.random.as_ref())?;
            return self.commit(policy).map(Some);
        }
        let policy = Arc::new(policy);
        self.cache_insert(&policy);
        Ok(Some(policy))
    }

    /// Archive new versions, trim the resident window and write the primary
    /// record. Only `policy` is modified; it is a private copy.
    fn persist(&self, policy: &mut Policy) -> Result<()> {
        let committed = policy.archive_version;
        if policy.latest_version > committed {
            let mut archive = Archive::load(self.storage.as_ref(), &policy.name)?;
            if archive.latest_version() > committed {
                debug!(
                    policy = %policy.name,
                    committed,
                    "replacing archived versions left by an uncommitted write"
                );
            }
            for entry in policy.keys.iter().filter(|e| e.version > committed) {
                archive.record(entry, committed);
            }
            archive.save(self.storage.as_ref(), &policy.name)?;
            policy.archive_version = policy.latest_version;
        }

        let evicted = policy.enforce_window(self.config.resident_versions);
        if evicted > 0 {
            debug!(
                policy = %policy.name,
                evicted,
                oldest_resident = ?policy.keys.oldest_version(),
                "evicted key versions to archive"
            );
        }

        self.storage
            .put(&Policy::storage_key(&policy.name), policy.to_bytes()?)
    }

    /// Persist `next` and make it the cached policy. Caller holds the policy
    /// lock exclusively.
    fn commit(&self, mut next: Policy) -> Result<Arc<Policy>> {
        if let Err(err) = self.persist(&mut next) {
            warn!(
                policy = %next.name,
                error = %err,
                "failed to persist policy; keeping previous state"
            );
            return Err(err);
        }
        let next = Arc::new(next);
        self.cache_insert(&next);
        Ok(next)
    }

    /// Run a read operation under the shared lock, escalating only when an
    /// old record must be upgraded first
    fn with_policy<T>(&self, name: &str, op: impl FnOnce(&Policy) -> Result<T>) -> Result<T> {
        let lock = self.policy_lock(name);
        {
            let _shared = lock.read();
            match self.lookup(name)? {
                Lookup::Ready(policy) => return op(policy.as_ref()),
                Lookup::Absent => return Err(not_found(name)),
                Lookup::NeedsUpgrade => {}
            }
        }

        let exclusive = lock.write();
        let policy = self.load_for_write(name)?.ok_or_else(|| not_found(name))?;
        let _shared = RwLockWriteGuard::downgrade(exclusive);
        op(policy.as_ref())
    }

    /// Like `with_policy`, creating the policy from `options` when absent
    fn with_policy_or_create<T>(
        &self,
        name: &str,
        options: &PolicyOptions,
        op: impl FnOnce(&Policy) -> Result<T>,
    ) -> Result<T> {
        let lock = self.policy_lock(name);
        {
            let _shared = lock.read();
            if let Lookup::Ready(policy) = self.lookup(name)? {
                return op(policy.as_ref());
            }
        }

        let exclusive = lock.write();
        let policy = match self.load_for_write(name)? {
            Some(policy) => policy,
            None => {
                let created = self.commit(Policy::create(name, options, self.random.as_ref())?)?;
                info!(policy = %name, derived = options.derived, "created policy on encrypt");
                created
            }
        };
        let _shared = RwLockWriteGuard::downgrade(exclusive);
        op(policy.as_ref())
    }

    /// Apply `op` to a copy of the policy under the exclusive lock, commit it,
    /// then read the result with `then` before releasing the lock
    fn mutate<T>(
        &self,
        name: &str,
        op: impl FnOnce(&mut Policy) -> Result<()>,
        then: impl FnOnce(&Policy) -> Result<T>,
    ) -> Result<T> {
        let lock = self.policy_lock(name);
        let _exclusive = lock.write();
        let current = self.load_for_write(name)?.ok_or_else(|| not_found(name))?;
        let mut next = Policy::clone(&current);
        op(&mut next)?;
        let committed = self.commit(next)?;
        then(committed.as_ref())
    }

    /// Create `name`, or validate the request against the existing policy
    pub fn create_or_update_policy(
        &self,
        name: &str,
        options: &PolicyOptions,
    ) -> Result<PolicyInfo> {
        let lock = self.policy_lock(name);
        let _exclusive = lock.write();

        let policy = match self.load_for_write(name)? {
            Some(existing) => {
                existing.check_compatible(options)?;
                if options.exportable && !existing.exportable() {
                    let mut next = Policy::clone(&existing);
                    next.exportable = true;
                    self.commit(next)?
                } else {
                    existing
                }
            }
            None => {
                let created = self.commit(Policy::create(name, options, self.random.as_ref())?)?;
                info!(
                    policy = %name,
                    derived = options.derived,
                    convergent = options.convergent_encryption,
                    "created policy"
                );
                created
            }
        };
        policy.info(self.storage.as_ref())
    }

    /// Metadata of `name`. Never creates the policy.
    pub fn read_policy(&self, name: &str) -> Result<PolicyInfo> {
        self.with_policy(name, |policy| policy.info(self.storage.as_ref()))
    }

    pub fn list_policies(&self) -> Result<Vec<String>> {
        Ok(self
            .storage
            .list(POLICY_PREFIX)?
            .into_iter()
            .filter_map(|key| key.strip_prefix(POLICY_PREFIX).map(str::to_string))
            .collect())
    }

    pub fn update_config(&self, name: &str, update: &ConfigUpdate) -> Result<PolicyInfo> {
        let info = self.mutate(
            name,
            |policy| policy.apply_config(update),
            |policy| policy.info(self.storage.as_ref()),
        )?;
        info!(
            policy = %name,
            min_decryption_version = info.min_decryption_version,
            min_encryption_version = info.min_encryption_version,
            deletion_allowed = info.deletion_allowed,
            "updated policy configuration"
        );
        Ok(info)
    }

    /// Append a new key version; returns the new latest version
    pub fn rotate(&self, name: &str) -> Result<u32> {
        let latest = self.mutate(
            name,
            |policy| policy.rotate(self.random.as_ref()).map(|_| ()),
            |policy| Ok(policy.latest_version()),
        )?;
        info!(policy = %name, version = latest, "rotated policy");
        Ok(latest)
    }

    pub fn encrypt(&self, name: &str, request: &EncryptRequest) -> Result<String> {
        let plaintext = request
            .plaintext
            .as_deref()
            .ok_or_else(|| TransitError::InvalidInput("missing 'plaintext'".into()))?;
        let context = request.context.as_deref();
        let nonce = request.nonce.as_deref();
        let op = |policy: &Policy| {
            policy.encrypt(
                self.storage.as_ref(),
                self.random.as_ref(),
                plaintext,
                context,
                nonce,
            )
        };

        if request.upsert {
            let options = PolicyOptions {
                derived: context.is_some(),
                convergent_encryption: request.convergent_encryption,
                ..Default::default()
            };
            self.with_policy_or_create(name, &options, op)
        } else {
            self.with_policy(name, op)
        }
    }

    pub fn decrypt(&self, name: &str, ciphertext: &str, context: Option<&[u8]>) -> Result<Vec<u8>> {
        self.with_policy(name, |policy| {
            policy.decrypt(self.storage.as_ref(), ciphertext, context)
        })
    }

    /// Re-encrypt `ciphertext` under the current encryption version without
    /// returning the plaintext
    pub fn rewrap(
        &self,
        name: &str,
        ciphertext: &str,
        context: Option<&[u8]>,
        nonce: Option<&[u8]>,
    ) -> Result<String> {
        self.with_policy(name, |policy| {
            policy.rewrap(
                self.storage.as_ref(),
                self.random.as_ref(),
                ciphertext,
                context,
                nonce,
            )
        })
    }

    pub fn generate_data_key(&self, name: &str, request: &DataKeyRequest) -> Result<DataKey> {
        let len = datakey::key_length(request.bits)?;
        let key = SecureKey::generate(self.random.as_ref(), len)?;
        let ciphertext = self.with_policy(name, |policy| {
            policy.encrypt(
                self.storage.as_ref(),
                self.random.as_ref(),
                key.as_bytes(),
                request.context.as_deref(),
                request.nonce.as_deref(),
            )
        })?;

        Ok(DataKey {
            ciphertext,
            plaintext: (!request.no_plaintext).then_some(key),
        })
    }

    /// Remove the policy, its key versions and its archive. Requires
    /// `deletion_allowed`.
    ///
    /// The primary record goes first. If removing the archive then fails, a
    /// retry finds only the archive left and finishes the job.
    pub fn delete_policy(&self, name: &str) -> Result<()> {
        let lock = self.policy_lock(name);
        let _exclusive = lock.write();

        let Some(policy) = self.load_for_write(name)? else {
            if self.storage.get(&Archive::storage_key(name))?.is_none() {
                return Err(not_found(name));
            }
            warn!(policy = %name, "removing archive left by an interrupted delete");
            return Archive::delete(self.storage.as_ref(), name);
        };
        if !policy.deletion_allowed() {
            return Err(TransitError::PermissionDenied(format!(
                "deletion is not allowed for policy '{}'",
                name
            )));
        }

        self.storage.delete(&Policy::storage_key(name))?;
        self.cache.write().remove(name);
        Archive::delete(self.storage.as_ref(), name)?;
        info!(policy = %name, "deleted policy");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ARCHIVE_PREFIX;
    use crate::envelope::CiphertextEnvelope;
    use crate::storage::InMemoryStorage;
    use std::sync::atomic::{AtomicBool, Ordering};

    const PLAINTEXT: &[u8] = b"the quick brown fox";

    /// Storage whose writes can be switched to fail
    #[derive(Default)]
    struct FlakyStorage {
        inner: InMemoryStorage,
        fail_writes: AtomicBool,
        fail_archive_deletes: AtomicBool,
    }

    impl KeyValueStore for FlakyStorage {
        fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            self.inner.get(key)
        }

        fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(TransitError::Storage("disk full".into()));
            }
            self.inner.put(key, value)
        }

        fn delete(&self, key: &str) -> Result<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(TransitError::Storage("disk full".into()));
            }
            if key.starts_with(ARCHIVE_PREFIX) && self.fail_archive_deletes.load(Ordering::SeqCst) {
                return Err(TransitError::Storage("io".into()));
            }
            self.inner.delete(key)
        }

        fn list(&self, prefix: &str) -> Result<Vec<String>> {
            self.inner.list(prefix)
        }
    }

    fn store() -> PolicyStore<InMemoryStorage> {
        PolicyStore::new(Arc::new(InMemoryStorage::new()), StoreConfig::default()).unwrap()
    }

    fn store_with(config: StoreConfig) -> PolicyStore<InMemoryStorage> {
        PolicyStore::new(Arc::new(InMemoryStorage::new()), config).unwrap()
    }

    #[test]
    fn test_read_missing_does_not_create() {
        let store = store();
        assert!(matches!(store.read_policy("test"), Err(TransitError::NotFound(_))));
        assert!(matches!(
            store.encrypt("test", &EncryptRequest::new(PLAINTEXT)),
            Err(TransitError::NotFound(_))
        ));
        assert!(store.list_policies().unwrap().is_empty());
    }

    #[test]
    fn test_create_encrypt_decrypt() {
        let store = store();
        let info = store
            .create_or_update_policy("test", &PolicyOptions::default())
            .unwrap();
        assert_eq!(info.latest_version, 1);
        assert_eq!(store.list_policies().unwrap(), vec!["test"]);

        let ct = store.encrypt("test", &EncryptRequest::new(PLAINTEXT)).unwrap();
        assert_eq!(store.decrypt("test", &ct, None).unwrap(), PLAINTEXT);
    }

    #[test]
    fn test_missing_plaintext_rejected_but_empty_allowed() {
        let store = store();
        store.create_or_update_policy("test", &PolicyOptions::default()).unwrap();

        let missing = EncryptRequest::default();
        assert!(matches!(
            store.encrypt("test", &missing),
            Err(TransitError::InvalidInput(_))
        ));

        let ct = store.encrypt("test", &EncryptRequest::new(Vec::new())).unwrap();
        assert!(store.decrypt("test", &ct, None).unwrap().is_empty());
    }

    #[test]
    fn test_upsert_creates_policy() {
        let store = store();
        let ct = store
            .encrypt("test", &EncryptRequest::new(PLAINTEXT).upsert())
            .unwrap();
        assert_eq!(store.list_policies().unwrap(), vec!["test"]);
        assert!(!store.read_policy("test").unwrap().derived);
        assert_eq!(store.decrypt("test", &ct, None).unwrap(), PLAINTEXT);

        let derived = store
            .encrypt(
                "tenant",
                &EncryptRequest::new(PLAINTEXT).with_context("ctx").upsert(),
            )
            .unwrap();
        assert!(store.read_policy("tenant").unwrap().derived);
        assert_eq!(
            store.decrypt("tenant", &derived, Some(b"ctx")).unwrap(),
            PLAINTEXT
        );
    }

    #[test]
    fn test_create_conflicts() {
        let store = store();
        let convergent_without_derived = PolicyOptions {
            convergent_encryption: true,
            ..Default::default()
        };
        assert!(matches!(
            store.create_or_update_policy("test", &convergent_without_derived),
            Err(TransitError::InvalidInput(_))
        ));
        assert!(store.list_policies().unwrap().is_empty());

        store
            .create_or_update_policy(
                "test",
                &PolicyOptions {
                    derived: true,
                    ..Default::default()
                },
            )
            .unwrap();
        let toggle = PolicyOptions {
            derived: true,
            convergent_encryption: true,
            ..Default::default()
        };
        assert!(matches!(
            store.create_or_update_policy("test", &toggle),
            Err(TransitError::Conflict(_))
        ));
    }

    #[test]
    fn test_delete_requires_permission() {
        let store = store();
        store.create_or_update_policy("test", &PolicyOptions::default()).unwrap();
        store.rotate("test").unwrap();

        assert!(matches!(
            store.delete_policy("test"),
            Err(TransitError::PermissionDenied(_))
        ));
        assert!(store.read_policy("test").is_ok());

        store
            .update_config(
                "test",
                &ConfigUpdate {
                    deletion_allowed: Some(true),
                    ..Default::default()
                },
            )
            .unwrap();
        store.delete_policy("test").unwrap();

        assert!(matches!(store.read_policy("test"), Err(TransitError::NotFound(_))));
        assert!(!store.is_cached("test"));
        assert!(store.storage().is_empty());
    }

    #[test]
    fn test_interrupted_delete_can_be_retried() {
        let storage = Arc::new(FlakyStorage::default());
        let store = PolicyStore::new(Arc::clone(&storage), StoreConfig::default()).unwrap();
        store.create_or_update_policy("t", &PolicyOptions::default()).unwrap();
        store.rotate("t").unwrap();
        store
            .update_config(
                "t",
                &ConfigUpdate {
                    deletion_allowed: Some(true),
                    ..Default::default()
                },
            )
            .unwrap();

        storage.fail_archive_deletes.store(true, Ordering::SeqCst);
        assert!(matches!(store.delete_policy("t"), Err(TransitError::Storage(_))));
        assert!(matches!(store.read_policy("t"), Err(TransitError::NotFound(_))));
        assert!(storage.get("archive/t").unwrap().is_some());

        storage.fail_archive_deletes.store(false, Ordering::SeqCst);
        store.delete_policy("t").unwrap();
        assert!(storage.get("archive/t").unwrap().is_none());
        assert!(storage.inner.is_empty());
        assert!(matches!(store.delete_policy("t"), Err(TransitError::NotFound(_))));
    }

    #[test]
    fn test_lock_table_is_bounded() {
        let store = store();
        for i in 0..10_000 {
            assert!(store.read_policy(&format!("missing-{}", i)).is_err());
        }
        store.create_or_update_policy("gone", &PolicyOptions::default()).unwrap();
        store
            .update_config(
                "gone",
                &ConfigUpdate {
                    deletion_allowed: Some(true),
                    ..Default::default()
                },
            )
            .unwrap();
        store.delete_policy("gone").unwrap();

        assert_eq!(store.locks.len(), LOCK_STRIPES);
        assert!(!store.is_cached("gone"));
        assert_eq!(
            PolicyStore::<InMemoryStorage>::lock_index("gone"),
            PolicyStore::<InMemoryStorage>::lock_index("gone")
        );
        assert!((0..64)
            .map(|i| PolicyStore::<InMemoryStorage>::lock_index(&format!("p{}", i)))
            .any(|idx| idx != PolicyStore::<InMemoryStorage>::lock_index("p0")));
    }

    #[test]
    fn test_failed_rotation_leaves_state_unchanged() {
        let storage = Arc::new(FlakyStorage::default());
        let store = PolicyStore::new(Arc::clone(&storage), StoreConfig::default()).unwrap();
        store.create_or_update_policy("test", &PolicyOptions::default()).unwrap();
        let ct = store.encrypt("test", &EncryptRequest::new(PLAINTEXT)).unwrap();

        storage.fail_writes.store(true, Ordering::SeqCst);
        assert!(matches!(store.rotate("test"), Err(TransitError::Storage(_))));
        assert!(store
            .update_config(
                "test",
                &ConfigUpdate {
                    deletion_allowed: Some(true),
                    ..Default::default()
                },
            )
            .is_err());

        let info = store.read_policy("test").unwrap();
        assert_eq!(info.latest_version, 1);
        assert!(!info.deletion_allowed);
        assert_eq!(store.decrypt("test", &ct, None).unwrap(), PLAINTEXT);

        storage.fail_writes.store(false, Ordering::SeqCst);
        assert_eq!(store.rotate("test").unwrap(), 2);
        assert_eq!(store.decrypt("test", &ct, None).unwrap(), PLAINTEXT);
    }

    #[test]
    fn test_resident_window_and_archive() {
        let store = store_with(StoreConfig {
            resident_versions: 2,
            ..Default::default()
        });
        store.create_or_update_policy("test", &PolicyOptions::default()).unwrap();

        let mut history = Vec::new();
        for _ in 0..5 {
            history.push(store.encrypt("test", &EncryptRequest::new(PLAINTEXT)).unwrap());
            store.rotate("test").unwrap();
        }

        let record = store.storage().get("policy/test").unwrap().unwrap();
        let persisted = Policy::from_bytes(&record).unwrap();
        assert_eq!(persisted.keys().len(), 2);
        assert_eq!(persisted.archive_version(), 6);
        assert_eq!(Archive::load(store.storage().as_ref(), "test").unwrap().len(), 6);

        for ct in &history {
            assert_eq!(store.decrypt("test", ct, None).unwrap(), PLAINTEXT);
        }
        assert_eq!(store.read_policy("test").unwrap().versions.len(), 6);
    }

    #[test]
    fn test_min_decryption_version_round_trip() {
        let store = store();
        store.create_or_update_policy("test", &PolicyOptions::default()).unwrap();
        let c1 = store.encrypt("test", &EncryptRequest::new(PLAINTEXT)).unwrap();
        store.rotate("test").unwrap();
        store.rotate("test").unwrap();

        let raise = ConfigUpdate {
            min_decryption_version: Some(3),
            ..Default::default()
        };
        store.update_config("test", &raise).unwrap();
        assert!(store.decrypt("test", &c1, None).unwrap_err().is_too_old());
        assert_eq!(store.read_policy("test").unwrap().versions.len(), 1);

        let lower = ConfigUpdate {
            min_decryption_version: Some(1),
            ..Default::default()
        };
        store.update_config("test", &lower).unwrap();
        assert_eq!(store.decrypt("test", &c1, None).unwrap(), PLAINTEXT);

        let invalid = ConfigUpdate {
            min_decryption_version: Some(4),
            ..Default::default()
        };
        assert!(store.update_config("test", &invalid).is_err());
    }

    #[test]
    fn test_rewrap_uses_latest() {
        let store = store();
        store.create_or_update_policy("test", &PolicyOptions::default()).unwrap();
        let ct = store.encrypt("test", &EncryptRequest::new(PLAINTEXT)).unwrap();
        store.rotate("test").unwrap();

        let rewrapped = store.rewrap("test", &ct, None, None).unwrap();
        assert_eq!(CiphertextEnvelope::parse_version(&rewrapped).unwrap(), 2);
        assert_eq!(store.decrypt("test", &rewrapped, None).unwrap(), PLAINTEXT);
    }

    #[test]
    fn test_data_keys() {
        let store = store();
        store.create_or_update_policy("test", &PolicyOptions::default()).unwrap();

        let with_plaintext = store
            .generate_data_key("test", &DataKeyRequest::default())
            .unwrap();
        let key = with_plaintext.plaintext.as_ref().unwrap();
        assert_eq!(key.len(), 32);
        assert_eq!(
            store.decrypt("test", &with_plaintext.ciphertext, None).unwrap(),
            key.as_bytes()
        );

        let wrapped = store
            .generate_data_key(
                "test",
                &DataKeyRequest {
                    bits: Some(128),
                    no_plaintext: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(wrapped.plaintext.is_none());
        assert_eq!(store.decrypt("test", &wrapped.ciphertext, None).unwrap().len(), 16);

        assert!(store
            .generate_data_key(
                "test",
                &DataKeyRequest {
                    bits: Some(100),
                    ..Default::default()
                },
            )
            .is_err());
    }

    #[test]
    fn test_cache_disabled_reads_through() {
        let store = store_with(StoreConfig {
            cache_enabled: false,
            ..Default::default()
        });
        store.create_or_update_policy("test", &PolicyOptions::default()).unwrap();
        assert!(!store.is_cached("test"));

        let ct = store.encrypt("test", &EncryptRequest::new(PLAINTEXT)).unwrap();
        store.rotate("test").unwrap();
        assert_eq!(store.read_policy("test").unwrap().latest_version, 2);
        assert_eq!(store.decrypt("test", &ct, None).unwrap(), PLAINTEXT);
        assert!(!store.is_cached("test"));
    }

    #[test]
    fn test_legacy_record_is_migrated_on_load() {
        let storage = Arc::new(InMemoryStorage::new());
        let legacy_key = SecureKey::new(vec![11u8; 32]);
        let record = format!(
            r#"{{"name":"legacy","type":"aes256-gcm96","derived":false,"key":{}}}"#,
            serde_json::to_string(&legacy_key).unwrap()
        );
        storage.put("policy/legacy", record.into_bytes()).unwrap();

        let store = PolicyStore::new(Arc::clone(&storage), StoreConfig::default()).unwrap();
        let info = store.read_policy("legacy").unwrap();
        assert_eq!(info.latest_version, 1);
        assert_eq!(info.min_decryption_version, 1);

        let record = storage.get("policy/legacy").unwrap().unwrap();
        let persisted = Policy::from_bytes(&record).unwrap();
        assert!(!persisted.needs_upgrade());
        assert_eq!(
            persisted.keys().get(1).unwrap().key.as_bytes(),
            legacy_key.as_bytes()
        );

        let ct = store.encrypt("legacy", &EncryptRequest::new(PLAINTEXT)).unwrap();
        assert!(ct.starts_with("v1:"));
        assert_eq!(store.rotate("legacy").unwrap(), 2);
        assert_eq!(store.decrypt("legacy", &ct, None).unwrap(), PLAINTEXT);
    }
}
