//! Cryptographic primitives for the transit engine
//!
//! AES-256-GCM with caller-chosen nonces, a zeroizing key wrapper and the
//! random-source seam used for key and nonce generation.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Result, TransitError};

/// AES-256 key size in bytes (256 bits)
pub const AES_256_KEY_SIZE: usize = 32;

/// AES-GCM nonce size in bytes (96 bits)
pub const NONCE_SIZE: usize = 12;

/// AES-GCM authentication tag size in bytes (128 bits)
pub const TAG_SIZE: usize = 16;

/// A secure key wrapper that zeroizes memory on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecureKey {
    bytes: Vec<u8>,
}

impl SecureKey {
    /// Create a new SecureKey from raw bytes
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Generate `len` random bytes of key material from `random`
    pub fn generate(random: &dyn RandomSource, len: usize) -> Result<Self> {
        let mut bytes = vec![0u8; len];
        random.fill_bytes(&mut bytes)?;
        Ok(Self { bytes })
    }

    /// Get the key bytes (use with caution)
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl std::fmt::Debug for SecureKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecureKey([REDACTED])")
    }
}

// Persisted records carry key material as standard base64.
impl Serialize for SecureKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut encoded = STANDARD.encode(&self.bytes);
        let result = serializer.serialize_str(&encoded);
        encoded.zeroize();
        result
    }
}

impl<'de> Deserialize<'de> for SecureKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let mut encoded = String::deserialize(deserializer)?;
        let decoded = STANDARD.decode(&encoded).map_err(serde::de::Error::custom);
        encoded.zeroize();
        Ok(SecureKey::new(decoded?))
    }
}

/// Source of randomness for keys and nonces.
///
/// Injected into the store so tests can substitute their own generator.
pub trait RandomSource: Send + Sync {
    fn fill_bytes(&self, dest: &mut [u8]) -> Result<()>;
}

/// Operating-system CSPRNG
#[derive(Debug, Default, Clone, Copy)]
pub struct OsRandom;

impl RandomSource for OsRandom {
    fn fill_bytes(&self, dest: &mut [u8]) -> Result<()> {
        OsRng
            .try_fill_bytes(dest)
            .map_err(|e| TransitError::Crypto(format!("random source failed: {}", e)))
    }
}

/// Nonce plus ciphertext-with-tag, as carried inside an envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedData {
    /// The nonce used for encryption (12 bytes for AES-GCM)
    pub nonce: Vec<u8>,
    /// The ciphertext including authentication tag
    pub ciphertext: Vec<u8>,
}

impl EncryptedData {
    pub fn new(nonce: Vec<u8>, ciphertext: Vec<u8>) -> Self {
        Self { nonce, ciphertext }
    }

    /// Encode `nonce ‖ ciphertext` as base64
    pub fn to_base64(&self) -> String {
        let combined = [self.nonce.as_slice(), self.ciphertext.as_slice()].concat();
        STANDARD.encode(combined)
    }

    /// Decode from base64. Any failure is reported as an invalid ciphertext.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let decoded = STANDARD
            .decode(encoded)
            .map_err(|_| TransitError::invalid_ciphertext())?;

        if decoded.len() < NONCE_SIZE + TAG_SIZE {
            return Err(TransitError::invalid_ciphertext());
        }

        let (nonce, ciphertext) = decoded.split_at(NONCE_SIZE);
        Ok(Self {
            nonce: nonce.to_vec(),
            ciphertext: ciphertext.to_vec(),
        })
    }
}

/// AES-256-GCM cipher wrapper
pub struct AesGcmCipher;

impl AesGcmCipher {
    /// Encrypt plaintext using AES-256-GCM under an explicit nonce
    ///
    /// # Arguments
    /// * `key` - The 256-bit encryption key
    /// * `nonce` - 12-byte nonce; the caller decides whether it is random or derived
    /// * `plaintext` - The data to encrypt (may be empty)
    /// * `aad` - Additional authenticated data (optional context)
    pub fn encrypt(
        key: &SecureKey,
        nonce: &[u8],
        plaintext: &[u8],
        aad: Option<&[u8]>,
    ) -> Result<EncryptedData> {
        let cipher = Self::cipher(key)?;

        if nonce.len() != NONCE_SIZE {
            return Err(TransitError::InvalidInput(format!(
                "invalid nonce length: expected {}, got {}",
                NONCE_SIZE,
                nonce.len()
            )));
        }

        let payload = Payload {
            msg: plaintext,
            aad: aad.unwrap_or_default(),
        };
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(nonce), payload)
            .map_err(|e| TransitError::Crypto(format!("encryption error: {}", e)))?;

        Ok(EncryptedData::new(nonce.to_vec(), ciphertext))
    }

    /// Decrypt ciphertext using AES-256-GCM
    ///
    /// Tag mismatches (wrong key, wrong context, tampering) all surface as
    /// [`TransitError::AuthenticationFailed`].
    pub fn decrypt(
        key: &SecureKey,
        encrypted: &EncryptedData,
        aad: Option<&[u8]>,
    ) -> Result<Vec<u8>> {
        let cipher = Self::cipher(key)?;

        if encrypted.nonce.len() != NONCE_SIZE {
            return Err(TransitError::invalid_ciphertext());
        }

        let payload = Payload {
            msg: encrypted.ciphertext.as_slice(),
            aad: aad.unwrap_or_default(),
        };
        cipher
            .decrypt(Nonce::from_slice(&encrypted.nonce), payload)
            .map_err(|_| TransitError::AuthenticationFailed)
    }

    fn cipher(key: &SecureKey) -> Result<Aes256Gcm> {
        if key.len() != AES_256_KEY_SIZE {
            return Err(TransitError::Crypto(format!(
                "invalid key size: expected {}, got {}",
                AES_256_KEY_SIZE,
                key.len()
            )));
        }
        Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|e| TransitError::Crypto(format!("cipher init error: {}", e)))
    }
}

/// Generate cryptographically secure random bytes
pub fn generate_random_bytes(random: &dyn RandomSource, len: usize) -> Result<Vec<u8>> {
    let mut bytes = vec![0u8; len];
    random.fill_bytes(&mut bytes)?;
    Ok(bytes)
}
