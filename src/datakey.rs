//! Data-key generation: a fresh random key wrapped under a named policy

use serde::Serialize;

use crate::error::{Result, TransitError};
use crate::crypto::SecureKey;

pub const DEFAULT_DATA_KEY_BITS: u32 = 256;
pub const MIN_DATA_KEY_BITS: u32 = 128;
pub const MAX_DATA_KEY_BITS: u32 = 512;

/// Parameters of a data-key request
#[derive(Debug, Clone, Default)]
pub struct DataKeyRequest {
    /// Key length in bits; defaults to 256
    pub bits: Option<u32>,
    /// Return only the wrapped key
    pub no_plaintext: bool,
    pub context: Option<Vec<u8>>,
    pub nonce: Option<Vec<u8>>,
}

/// A generated data key. `plaintext` is `None` when the caller suppressed it.
#[derive(Debug, Clone, Serialize)]
pub struct DataKey {
    pub ciphertext: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plaintext: Option<SecureKey>,
}

/// Byte length for a requested bit length: a multiple of 8 within
/// `MIN_DATA_KEY_BITS..=MAX_DATA_KEY_BITS`
pub fn key_length(bits: Option<u32>) -> Result<usize> {
    let bits = bits.unwrap_or(DEFAULT_DATA_KEY_BITS);
    if bits % 8 != 0 {
        return Err(TransitError::InvalidInput(format!(
            "data key bit length {} is not a multiple of 8",
            bits
        )));
    }
    if !(MIN_DATA_KEY_BITS..=MAX_DATA_KEY_BITS).contains(&bits) {
        return Err(TransitError::InvalidInput(format!(
            "data key bit length must be between {} and {}, got {}",
            MIN_DATA_KEY_BITS, MAX_DATA_KEY_BITS, bits
        )));
    }
    Ok((bits / 8) as usize)
}
