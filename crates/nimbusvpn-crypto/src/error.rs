//! Cryptographic error types

use thiserror::Error;

/// Result type for cryptographic operations
pub type Result<T> = std::result::Result<T, CryptoError>;

/// Cryptographic errors
///
/// Uses `&'static str` for error messages on hot paths to avoid allocations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Invalid key length
    #[error("invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength {
        /// Expected key length
        expected: usize,
        /// Actual key length
        got: usize,
    },

    /// Encryption failed
    #[error("encryption failed: {0}")]
    EncryptionFailed(&'static str),

    /// Decryption failed (authentication tag or padding mismatch)
    #[error("decryption failed: authentication tag mismatch")]
    DecryptionFailed,

    /// HMAC verification failed
    #[error("HMAC verification failed")]
    HmacVerificationFailed,

    /// Replay attack detected on a wrapped control packet
    #[error("replay detected: stale replay id or timestamp")]
    ReplayDetected,

    /// Key derivation failed
    #[error("key derivation failed: {0}")]
    KeyDerivationFailed(&'static str),

    /// Unknown cipher or digest option name
    #[error("unknown algorithm name: {0}")]
    UnknownAlgorithm(String),

    /// Invalid PEM or static-key file format
    #[error("invalid key file: {0}")]
    InvalidKeyFile(String),
}
