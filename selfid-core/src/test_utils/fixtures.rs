//! Test fixtures
//!
//! Deterministic identities, signed frames and an in-memory relay handshake.

use serde_json::Value;
use tokio::sync::mpsc;

use super::async_helpers::{recv_unbounded_timeout, DEFAULT_TEST_TIMEOUT};
use crate::config::ClientConfig;
use crate::core_identity::{AppKeypair, EnvelopeSigner, KEY_LEN};
use crate::core_proto::{Frame, InboundMessage};
use crate::core_router::{MemoryConnector, MessagingClient, RelayEnd, StaticDirectory, AUTH_ID};

/// App id of the client under test
pub const TEST_APP_ID: &str = "app1";

/// Identity of the remote user in tests
pub const TEST_USER_ID: &str = "user1";

/// Device the remote user is registered with
pub const TEST_USER_DEVICE: &str = "d1";

pub fn test_keypair() -> AppKeypair {
    AppKeypair::from_seed(TEST_APP_ID, [42u8; KEY_LEN])
}

/// Signer for the app under test; the same seed every time
pub fn test_signer() -> EnvelopeSigner {
    EnvelopeSigner::new(test_keypair())
}

/// Signer for the remote user
pub fn user_signer() -> EnvelopeSigner {
    EnvelopeSigner::new(AppKeypair::from_seed(TEST_USER_ID, [7u8; KEY_LEN]))
}

/// Directory knowing the remote user and the app under test
pub fn test_directory() -> StaticDirectory {
    StaticDirectory::new()
        .with_identity(
            TEST_USER_ID,
            user_signer().keypair().public_key_base64(),
            vec![TEST_USER_DEVICE.to_string()],
        )
        .with_identity(TEST_APP_ID, test_keypair().public_key_base64(), vec!["1".to_string()])
}

/// Client config pointing at the in-memory relay
pub fn test_config() -> ClientConfig {
    ClientConfig::with_url("memory://relay")
}

/// `MSG` frame carrying `body` signed by `signer`
pub fn message_frame(signer: &EnvelopeSigner, id: &str, body: &Value) -> Frame {
    Frame::message(
        id,
        format!("{}:1", signer.app_id()),
        format!("{}:1", TEST_APP_ID),
        signer.sign(body).to_json().into_bytes(),
    )
}

/// Parsed form of `message_frame`
pub fn inbound_message(signer: &EnvelopeSigner, id: &str, body: &Value) -> InboundMessage {
    match message_frame(signer, id, body) {
        Frame::Message(wire) => InboundMessage::parse(&wire).expect("fixture body should parse"),
        other => panic!("Expected message frame, got {:?}", other),
    }
}

/// Accept the next connection and complete its AUTH handshake
pub async fn accept_handshake(relays: &mut mpsc::UnboundedReceiver<RelayEnd>) -> RelayEnd {
    let mut relay = recv_unbounded_timeout(relays, DEFAULT_TEST_TIMEOUT)
        .await
        .expect("client should connect");

    match relay.recv_frame().await {
        Some(Ok(Frame::Auth(auth))) => assert_eq!(auth.id, AUTH_ID),
        other => panic!("Expected AUTH frame, got {:?}", other),
    }
    relay.send(&Frame::ack(AUTH_ID)).await.expect("relay should ack");
    relay
}

/// Connect a client to a fresh in-memory relay.
///
/// Returns the client, the relay end of its link and the stream of later
/// connections (reconnects).
pub async fn connect_client(
    config: ClientConfig,
) -> (MessagingClient, RelayEnd, mpsc::UnboundedReceiver<RelayEnd>) {
    let (connector, mut relays) = MemoryConnector::new();
    let connecting = tokio::spawn(MessagingClient::connect(config, test_signer(), connector));

    let relay = accept_handshake(&mut relays).await;
    let client = connecting
        .await
        .expect("connect task should not panic")
        .expect("client should connect");
    (client, relay, relays)
}
