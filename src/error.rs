//! Error types for the transit engine

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, TransitError>;

/// Errors that can occur during policy and encryption operations
#[derive(Error, Debug)]
pub enum TransitError {
    /// Policy or key version absent
    #[error("not found: {0}")]
    NotFound(String),

    /// Ciphertext version is below the policy's minimum decryption version
    #[error("ciphertext version {version} is disallowed by policy (too old, minimum is {min})")]
    TooOld { version: u32, min: u32 },

    /// Malformed request or envelope
    #[error("{0}")]
    InvalidInput(String),

    /// AEAD tag mismatch. Reported exactly like a malformed envelope.
    #[error("invalid ciphertext")]
    AuthenticationFailed,

    /// Operation not permitted by the policy configuration
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Requested settings clash with an existing policy
    #[error("conflict: {0}")]
    Conflict(String),

    /// Storage operation failed
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Cryptographic primitive failed
    #[error("cryptographic error: {0}")]
    Crypto(String),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl TransitError {
    /// Envelope could not be parsed. Carries no detail on purpose.
    pub(crate) fn invalid_ciphertext() -> Self {
        TransitError::InvalidInput("invalid ciphertext".into())
    }

    pub fn is_too_old(&self) -> bool {
        matches!(self, TransitError::TooOld { .. })
    }
}

impl From<serde_json::Error> for TransitError {
    fn from(err: serde_json::Error) -> Self {
        TransitError::Serialization(err.to_string())
    }
}
