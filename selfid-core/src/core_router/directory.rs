//! Identity directory lookups.
//!
//! The messaging core needs two things from the network directory: the
//! devices registered for an identity and that identity's public key. The
//! HTTP client lives outside this crate and plugs in through `Directory`.

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("Unknown identity: {0}")]
    UnknownIdentity(String),

    #[error("Identity {0} has no registered devices")]
    NoDevices(String),

    #[error("Directory lookup failed: {0}")]
    Lookup(String),
}

#[async_trait]
pub trait Directory: Send + Sync {
    async fn devices(&self, identity: &str) -> Result<Vec<String>, DirectoryError>;

    /// Base64 encoded Ed25519 public key
    async fn public_key(&self, identity: &str) -> Result<String, DirectoryError>;
}

#[derive(Debug, Clone, Default)]
struct DirectoryEntry {
    devices: Vec<String>,
    public_key: String,
}

/// Fixed in-memory directory
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    entries: HashMap<String, DirectoryEntry>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_identity(
        mut self,
        identity: impl Into<String>,
        public_key: impl Into<String>,
        devices: Vec<String>,
    ) -> Self {
        self.insert(identity, public_key, devices);
        self
    }

    pub fn insert(
        &mut self,
        identity: impl Into<String>,
        public_key: impl Into<String>,
        devices: Vec<String>,
    ) {
        self.entries.insert(
            identity.into(),
            DirectoryEntry {
                devices,
                public_key: public_key.into(),
            },
        );
    }

    fn entry(&self, identity: &str) -> Result<&DirectoryEntry, DirectoryError> {
        self.entries
            .get(identity)
            .ok_or_else(|| DirectoryError::UnknownIdentity(identity.to_string()))
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn devices(&self, identity: &str) -> Result<Vec<String>, DirectoryError> {
        Ok(self.entry(identity)?.devices.clone())
    }

    async fn public_key(&self, identity: &str) -> Result<String, DirectoryError> {
        Ok(self.entry(identity)?.public_key.clone())
    }
}
