pub mod archive;
pub mod config;
pub mod crypto;
pub mod datakey;
pub mod envelope;
pub mod error;
pub mod kdf;
pub mod keyring;
pub mod policy;
pub mod storage;
pub mod store;

pub use archive::Archive;
pub use config::{StoreConfig, DEFAULT_RESIDENT_VERSIONS};
pub use crypto::{
    AesGcmCipher, EncryptedData, OsRandom, RandomSource, SecureKey, AES_256_KEY_SIZE, NONCE_SIZE,
};
pub use datakey::{DataKey, DataKeyRequest};
pub use envelope::CiphertextEnvelope;
pub use error::{Result, TransitError};
pub use kdf::Kdf;
pub use keyring::{KeyRing, KeyVersionEntry};
pub use policy::{ConfigUpdate, KeyType, NonceMode, Policy, PolicyInfo, PolicyOptions};
pub use storage::{InMemoryStorage, KeyValueStore};
pub use store::{EncryptRequest, PolicyStore, LOCK_STRIPES};
