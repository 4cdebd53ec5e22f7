//! Keypair module
//!
//! An application identity is an app id bound to an Ed25519 signing key.
//! App secrets are handed out as base64 encoded 32 byte seeds, in either the
//! URL-safe or the standard alphabet and usually without padding.
//!
//! Security: the signing key zeroizes itself on drop and decoded seed buffers
//! are wrapped in `Zeroizing`.

use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::Rng;
use std::fmt;
use zeroize::Zeroizing;

use super::error::IdentityError;

/// Length of an Ed25519 seed and of an encoded public key
pub const KEY_LEN: usize = 32;

/// Length of an Ed25519 signature
pub const SIGNATURE_LEN: usize = 64;

/// Application identity: app id plus signing key
#[derive(Clone)]
pub struct AppKeypair {
    app_id: String,
    signing_key: SigningKey,
}

impl AppKeypair {
    /// Build a keypair from a raw 32 byte seed
    pub fn from_seed(app_id: impl Into<String>, seed: [u8; KEY_LEN]) -> Self {
        Self {
            app_id: app_id.into(),
            signing_key: SigningKey::from_bytes(&seed),
        }
    }

    /// Build a keypair from a base64 encoded seed (the app secret format)
    pub fn from_encoded_seed(
        app_id: impl Into<String>,
        encoded: &str,
    ) -> Result<Self, IdentityError> {
        let bytes = Zeroizing::new(decode_base64(encoded)?);
        let seed: [u8; KEY_LEN] =
            bytes.as_slice().try_into().map_err(|_| IdentityError::InvalidKeyLength {
                expected: KEY_LEN,
                actual: bytes.len(),
            })?;
        let seed = Zeroizing::new(seed);

        Ok(Self::from_seed(app_id, *seed))
    }

    /// Generate a fresh keypair from the thread RNG
    pub fn generate(app_id: impl Into<String>) -> Self {
        let mut csprng = rand::thread_rng();
        let seed = Zeroizing::new(csprng.gen::<[u8; KEY_LEN]>());
        Self::from_seed(app_id, *seed)
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Public key in the directory format (base64url, no padding)
    pub fn public_key_base64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.verifying_key().to_bytes())
    }

    /// Sign a message; Ed25519 signatures are deterministic
    pub fn sign(&self, msg: &[u8]) -> Signature {
        self.signing_key.sign(msg)
    }
}

impl fmt::Debug for AppKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppKeypair")
            .field("app_id", &self.app_id)
            .field("public", &hex::encode(self.verifying_key().to_bytes()))
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Parse a base64 encoded Ed25519 public key
pub fn parse_public_key(encoded: &str) -> Result<VerifyingKey, IdentityError> {
    let bytes = decode_base64(encoded)?;
    let bytes: [u8; KEY_LEN] =
        bytes.as_slice().try_into().map_err(|_| IdentityError::InvalidKeyLength {
            expected: KEY_LEN,
            actual: bytes.len(),
        })?;

    VerifyingKey::from_bytes(&bytes).map_err(|e| IdentityError::InvalidPublicKey(e.to_string()))
}

/// Check a raw signature; any malformed input simply fails verification
pub fn verify_signature(key: &VerifyingKey, msg: &[u8], sig: &[u8]) -> bool {
    if sig.len() != SIGNATURE_LEN {
        return false;
    }

    match Signature::from_slice(sig) {
        Ok(signature) => key.verify(msg, &signature).is_ok(),
        Err(_) => false,
    }
}

/// Decode base64 in either alphabet, with or without padding
pub(crate) fn decode_base64(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let trimmed = input.trim().trim_end_matches('=');
    if trimmed.contains(|c| c == '+' || c == '/') {
        STANDARD_NO_PAD.decode(trimmed)
    } else {
        URL_SAFE_NO_PAD.decode(trimmed)
    }
}
