//! Error types for FleetGate crypto operations.

use thiserror::Error;

/// Errors from key handling and signature verification.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Signature verification failed: {0}")]
    BadSignature(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
