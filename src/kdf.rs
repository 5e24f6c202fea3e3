//! Per-context key derivation
//!
//! Two algorithms are supported permanently: the legacy HMAC-SHA256 counter
//! mode, kept so that already-issued derived ciphertexts stay readable, and
//! HKDF-SHA256, which every new policy uses.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::crypto::{SecureKey, AES_256_KEY_SIZE, NONCE_SIZE};
use crate::error::{Result, TransitError};

type HmacSha256 = Hmac<Sha256>;

const CONVERGENT_NONCE_INFO: &[u8] = b"convergent-nonce";

/// Key derivation algorithm of a derived policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kdf {
    /// HMAC-SHA256 in counter mode (legacy)
    HmacSha256Counter,
    /// HKDF-SHA256 extract-then-expand
    HkdfSha256,
}

impl Kdf {
    pub fn as_str(&self) -> &'static str {
        match self {
            Kdf::HmacSha256Counter => "hmac_sha256_counter",
            Kdf::HkdfSha256 => "hkdf_sha256",
        }
    }
}

impl std::fmt::Display for Kdf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derive a 256-bit sub-key of `root` for `context`.
///
/// Pure and deterministic: identical inputs always give identical keys.
pub fn derive_key(kdf: Kdf, root: &SecureKey, context: &[u8]) -> Result<SecureKey> {
    if context.is_empty() {
        return Err(TransitError::InvalidInput(
            "missing 'context' for key derivation".into(),
        ));
    }
    match kdf {
        Kdf::HmacSha256Counter => counter_mode(root, context, AES_256_KEY_SIZE),
        Kdf::HkdfSha256 => hkdf_expand(root, context, AES_256_KEY_SIZE),
    }
}

/// HMAC-SHA256 over `context ‖ u32_be(counter)`, counter starting at 1,
/// concatenated until `len` bytes are available.
fn counter_mode(root: &SecureKey, context: &[u8], len: usize) -> Result<SecureKey> {
    let mut output = Vec::with_capacity(len + 32);
    let mut counter: u32 = 1;
    while output.len() < len {
        let mut mac = HmacSha256::new_from_slice(root.as_bytes())
            .map_err(|e| TransitError::Crypto(format!("HMAC init error: {}", e)))?;
        mac.update(context);
        mac.update(&counter.to_be_bytes());
        output.extend_from_slice(&mac.finalize().into_bytes());
        counter += 1;
    }
    output.truncate(len);
    Ok(SecureKey::new(output))
}

fn hkdf_expand(root: &SecureKey, info: &[u8], len: usize) -> Result<SecureKey> {
    let hkdf = Hkdf::<Sha256>::new(None, root.as_bytes());
    let mut output = vec![0u8; len];
    hkdf.expand(info, &mut output)
        .map_err(|e| TransitError::Crypto(format!("key derivation error: {}", e)))?;
    Ok(SecureKey::new(output))
}

/// Deterministic nonce for convergent encryption (version 2 and later).
///
/// Keyed by the version's HMAC key, or a key expanded from the encryption key
/// when the version predates HMAC keys. Binding the plaintext keeps distinct
/// plaintexts under one context from sharing a nonce.
pub fn convergent_nonce(
    hmac_key: Option<&SecureKey>,
    encryption_key: &SecureKey,
    version: u32,
    context: &[u8],
    plaintext: &[u8],
) -> Result<[u8; NONCE_SIZE]> {
    let fallback;
    let key = match hmac_key {
        Some(key) => key,
        None => {
            fallback = hkdf_expand(encryption_key, CONVERGENT_NONCE_INFO, AES_256_KEY_SIZE)?;
            &fallback
        }
    };

    let mut mac = HmacSha256::new_from_slice(key.as_bytes())
        .map_err(|e| TransitError::Crypto(format!("HMAC init error: {}", e)))?;
    mac.update(&version.to_be_bytes());
    mac.update(&(context.len() as u32).to_be_bytes());
    mac.update(context);
    mac.update(plaintext);
    let digest = mac.finalize().into_bytes();

    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&digest[..NONCE_SIZE]);
    Ok(nonce)
}
