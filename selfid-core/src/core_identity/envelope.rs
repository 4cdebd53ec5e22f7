//! Signed envelopes
//!
//! Every application message travels as a JWS-style envelope:
//!
//! ```json
//! {
//!     "payload": "<base64url(json body)>",
//!     "protected": "<base64url({\"alg\":\"EdDSA\",\"typ\":\"JWT\"})>",
//!     "signature": "<base64url(ed25519(protected + \".\" + payload))>"
//! }
//! ```
//!
//! The same three segments joined with dots form the compact token used for
//! the relay handshake. Verification always recomputes the signing input and
//! checks it against a key supplied by the caller, never one carried inside
//! the envelope.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::OnceLock;

use super::error::IdentityError;
use super::keypair::{decode_base64, parse_public_key, verify_signature, AppKeypair};

/// Signature algorithm advertised in the protected header
pub const ALGORITHM: &str = "EdDSA";

/// Token type advertised in the protected header
pub const TOKEN_TYPE: &str = "JWT";

/// Three part signed structure carrying one application message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub payload: String,
    pub protected: String,
    pub signature: String,
}

impl Envelope {
    /// The exact string the signature covers
    pub fn signing_input(&self) -> String {
        format!("{}.{}", self.protected, self.payload)
    }

    /// JSON object form, as carried in `MSG` ciphertext
    pub fn to_json(&self) -> String {
        json!({
            "payload": self.payload,
            "protected": self.protected,
            "signature": self.signature,
        })
        .to_string()
    }

    pub fn from_json(input: &[u8]) -> Result<Self, IdentityError> {
        serde_json::from_slice(input).map_err(|e| IdentityError::MalformedEnvelope(e.to_string()))
    }

    /// Compact `protected.payload.signature` form
    pub fn to_token(&self) -> String {
        format!("{}.{}.{}", self.protected, self.payload, self.signature)
    }

    pub fn from_token(token: &str) -> Result<Self, IdentityError> {
        let mut parts = token.split('.');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(protected), Some(payload), Some(signature), None) => Ok(Envelope {
                payload: payload.to_string(),
                protected: protected.to_string(),
                signature: signature.to_string(),
            }),
            _ => Err(IdentityError::MalformedEnvelope(
                "token must have exactly three segments".to_string(),
            )),
        }
    }

    /// Decode the JSON body without checking the signature
    pub fn decode_payload(&self) -> Result<Value, IdentityError> {
        let bytes = decode_base64(&self.payload)?;
        serde_json::from_slice(&bytes).map_err(|e| IdentityError::MalformedEnvelope(e.to_string()))
    }

    /// Check the signature against a known public key
    pub fn verify_with(&self, key: &VerifyingKey) -> bool {
        let signature = match decode_base64(&self.signature) {
            Ok(sig) => sig,
            Err(_) => return false,
        };
        verify_signature(key, self.signing_input().as_bytes(), &signature)
    }
}

/// Verify an envelope against a base64 encoded public key.
///
/// Returns false on any malformed key, malformed envelope or bad signature.
pub fn verify(envelope: &Envelope, public_key: &str) -> bool {
    match parse_public_key(public_key) {
        Ok(key) => envelope.verify_with(&key),
        Err(_) => false,
    }
}

#[derive(Serialize)]
struct ProtectedHeader {
    alg: &'static str,
    typ: &'static str,
}

fn encode_json(value: &impl Serialize) -> String {
    // Serializing plain structs and `Value`s into a Vec cannot fail.
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Signs envelopes for one application identity
#[derive(Debug)]
pub struct EnvelopeSigner {
    keypair: AppKeypair,
    protected: String,
    auth_token: OnceLock<String>,
}

impl EnvelopeSigner {
    pub fn new(keypair: AppKeypair) -> Self {
        let protected = encode_json(&ProtectedHeader {
            alg: ALGORITHM,
            typ: TOKEN_TYPE,
        });

        Self {
            keypair,
            protected,
            auth_token: OnceLock::new(),
        }
    }

    pub fn app_id(&self) -> &str {
        self.keypair.app_id()
    }

    pub fn keypair(&self) -> &AppKeypair {
        &self.keypair
    }

    /// Encoded protected header, identical for every envelope
    pub fn protected_header(&self) -> &str {
        &self.protected
    }

    pub fn sign(&self, payload: &Value) -> Envelope {
        let payload = encode_json(payload);
        let input = format!("{}.{}", self.protected, payload);
        let signature = URL_SAFE_NO_PAD.encode(self.keypair.sign(input.as_bytes()).to_bytes());

        Envelope {
            payload,
            protected: self.protected.clone(),
            signature,
        }
    }

    /// Bearer token asserting only the issuer; computed once per signer
    pub fn auth_token(&self) -> &str {
        self.auth_token
            .get_or_init(|| self.sign(&json!({ "iss": self.app_id() })).to_token())
    }
}
