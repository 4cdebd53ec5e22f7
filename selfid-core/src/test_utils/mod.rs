//! Test utilities shared by unit and integration tests
//!
//! Fixtures build deterministic signers and signed frames, and drive a
//! client through the handshake against an in-memory relay.

pub mod async_helpers;
pub mod fixtures;

pub use async_helpers::*;
pub use fixtures::*;
