//! Identity and envelope signing
//!
//! API exposed to the rest of the crate:
//! - `AppKeypair` -> app id plus Ed25519 signing key, built from the app secret seed
//! - `EnvelopeSigner::sign()` -> signed `Envelope` for an application payload
//! - `EnvelopeSigner::auth_token()` -> cached bearer token for the relay handshake
//! - `verify()` -> boolean signature check against a directory public key

mod envelope;
mod error;
mod keypair;

pub use envelope::{verify, Envelope, EnvelopeSigner, ALGORITHM, TOKEN_TYPE};
pub use error::IdentityError;
pub use keypair::{parse_public_key, verify_signature, AppKeypair, KEY_LEN, SIGNATURE_LEN};
