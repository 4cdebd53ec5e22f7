//! Identity error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Invalid base64 key material: {0}")]
    InvalidEncoding(#[from] base64::DecodeError),

    #[error("Invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),
}
