//! Text-safe ciphertext envelope: `v<version>:<base64(nonce ‖ ciphertext ‖ tag)>`

use crate::crypto::EncryptedData;
use crate::error::{Result, TransitError};

/// A parsed ciphertext envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CiphertextEnvelope {
    /// Key version that produced the ciphertext
    pub version: u32,
    pub encrypted_data: EncryptedData,
}

impl CiphertextEnvelope {
    pub fn new(version: u32, encrypted_data: EncryptedData) -> Self {
        Self {
            version,
            encrypted_data,
        }
    }

    /// Read only the version tag, without decoding the payload
    pub fn parse_version(envelope: &str) -> Result<u32> {
        let (tag, _) = envelope
            .split_once(':')
            .ok_or_else(TransitError::invalid_ciphertext)?;
        let digits = tag
            .strip_prefix('v')
            .ok_or_else(TransitError::invalid_ciphertext)?;
        match digits.parse::<u32>() {
            Ok(version) if version >= 1 => Ok(version),
            _ => Err(TransitError::invalid_ciphertext()),
        }
    }

    pub fn parse(envelope: &str) -> Result<Self> {
        let version = Self::parse_version(envelope)?;
        let (_, payload) = envelope
            .split_once(':')
            .ok_or_else(TransitError::invalid_ciphertext)?;
        let encrypted_data = EncryptedData::from_base64(payload)?;
        Ok(Self::new(version, encrypted_data))
    }

    pub fn encode(&self) -> String {
        format!("v{}:{}", self.version, self.encrypted_data.to_base64())
    }
}

impl std::fmt::Display for CiphertextEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encode())
    }
}
