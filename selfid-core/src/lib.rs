//! Messaging core for the Self identity network.
//!
//! - `core_identity` -> app keypair, signed envelopes, auth token
//! - `core_proto` -> relay frames, codec, application payloads
//! - `core_router` -> connection manager, correlation, dispatch, observers
//!
//! ```no_run
//! use selfid_core::config::ClientConfig;
//! use selfid_core::core_identity::{AppKeypair, EnvelopeSigner};
//! use selfid_core::core_router::{MessagingClient, WebSocketConnector};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let keypair = AppKeypair::from_encoded_seed("my-app-id", "<app secret>")?;
//! let client = MessagingClient::connect(
//!     ClientConfig::from_env()?,
//!     EnvelopeSigner::new(keypair),
//!     WebSocketConnector::new(),
//! )
//! .await?;
//!
//! client.permit_connection("*").await?;
//! client.close().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core_identity;
pub mod core_proto;
pub mod core_router;
pub mod logging;
pub mod shutdown;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use config::ClientConfig;
pub use core_router::{ClientError, ConnectionState, MessagingClient, Outcome};
pub use logging::{init_logging, LogLevel};
