/*
    Client Lifecycle Tests

    Drives a MessagingClient against the in-memory relay:
    - AUTH handshake and state transitions
    - acknowledgements, relay errors and timeouts
    - loss of the link, with and without auto-reconnect
    - re-authentication after a reconnect, accepted and rejected
    - keepalive failures
    - close releasing every pending wait
*/

use selfid_core::core_proto::Frame;
use selfid_core::core_router::{
    ConnectionState, MemoryConnector, MessagingClient, Outcome, RelayEnd, AUTH_ID,
};
use selfid_core::test_utils::async_helpers::{
    assert_completes_within, recv_unbounded_timeout, DEFAULT_TEST_TIMEOUT,
};
use selfid_core::test_utils::fixtures::{accept_handshake, connect_client, test_config, test_signer};
use selfid_core::ClientError;
use std::time::Duration;

async fn wait_for_state(client: &MessagingClient, expected: ConnectionState) {
    let mut changes = client.state_changes();
    assert_completes_within(DEFAULT_TEST_TIMEOUT, changes.wait_for(|state| *state == expected))
        .await
        .expect("state channel should stay open");
}

#[tokio::test]
async fn test_connect_reaches_connected() {
    let (client, relay, _relays) = connect_client(test_config()).await;

    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(relay.url, "memory://relay");
    assert_eq!(client.address(), "app1:1");
    assert_eq!(client.pending_waits().await, (0, 0));

    client.close().await;
}

#[tokio::test]
async fn test_ack_completes_wait() {
    let (client, mut relay, _relays) = connect_client(test_config()).await;

    let frame = Frame::message("m1", client.address(), "user1:d1", b"hello".to_vec());
    let relay_side = async {
        let received = relay.recv_frame().await.unwrap().unwrap();
        assert_eq!(received.id(), "m1");
        relay.send(&Frame::ack("m1")).await.unwrap();
    };

    let (outcome, ()) = tokio::join!(client.send_and_await_ack(frame), relay_side);
    assert_eq!(outcome.unwrap(), Outcome::Completed(()));
    assert_eq!(client.pending_waits().await, (0, 0));

    client.close().await;
}

#[tokio::test]
async fn test_relay_error_rejects_wait() {
    let (client, mut relay, _relays) = connect_client(test_config()).await;

    let frame = Frame::message("m2", client.address(), "user1:d1", b"hello".to_vec());
    let relay_side = async {
        relay.recv_frame().await.unwrap().unwrap();
        relay
            .send(&Frame::error("m2", "user1:d1", "recipient unknown"))
            .await
            .unwrap();
    };

    let (outcome, ()) = tokio::join!(client.send_and_await_ack(frame), relay_side);
    match outcome.unwrap() {
        Outcome::Rejected(rejection) => {
            assert_eq!(rejection.id, "m2");
            assert_eq!(rejection.sender, "user1:d1");
            assert_eq!(rejection.reason, "recipient unknown");
        }
        other => panic!("Expected rejection, got {:?}", other),
    }

    client.close().await;
}

#[tokio::test]
async fn test_duplicate_wait_is_refused() {
    let (client, mut relay, _relays) = connect_client(test_config()).await;

    let first = Frame::message("dup", client.address(), "user1:d1", Vec::new());
    let second = first.clone();

    let relay_side = async {
        relay.recv_frame().await.unwrap().unwrap();
        relay.send(&Frame::ack("dup")).await.unwrap();
    };

    // join! polls in order, so the first wait is registered before the second
    let (first, second, ()) = tokio::join!(
        client.send_and_await_ack(first),
        client.send_and_await_ack(second),
        relay_side
    );
    assert_eq!(first.unwrap(), Outcome::Completed(()));
    assert!(matches!(second, Err(ClientError::Correlation(_))));

    client.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_ack_times_out() {
    let mut config = test_config();
    config.ack_timeout = Duration::from_secs(2);
    config.sweep_interval = Duration::from_millis(500);
    let (client, mut relay, _relays) = connect_client(config).await;

    let frame = Frame::message("m3", client.address(), "user1:d1", Vec::new());
    let outcome = client.send_and_await_ack(frame).await.unwrap();
    assert_eq!(outcome, Outcome::TimedOut);

    // A late ack finds nobody waiting
    relay.recv_frame().await.unwrap().unwrap();
    relay.send(&Frame::ack("m3")).await.unwrap();
    assert_eq!(client.pending_waits().await, (0, 0));

    client.close().await;
}

#[tokio::test]
async fn test_write_without_link_fails() {
    let mut config = test_config();
    config.auto_reconnect = false;
    let (client, relay, _relays) = connect_client(config).await;

    drop(relay);
    wait_for_state(&client, ConnectionState::Closed).await;

    let frame = Frame::message("m4", client.address(), "user1:d1", Vec::new());
    let result = client.send_and_await_ack(frame).await;
    assert!(matches!(result, Err(ClientError::NotConnected)));
    assert_eq!(client.pending_waits().await, (0, 0));
}

#[tokio::test]
async fn test_link_loss_without_reconnect_closes() {
    let mut config = test_config();
    config.auto_reconnect = false;
    let (client, mut relay, _relays) = connect_client(config).await;

    let frame = Frame::message("m5", client.address(), "user1:d1", Vec::new());
    let relay_side = async move {
        relay.recv_frame().await.unwrap().unwrap();
        relay.close("relay going away").await;
    };

    let (outcome, ()) = tokio::join!(client.send_and_await_ack(frame), relay_side);
    assert_eq!(outcome.unwrap(), Outcome::Disconnected);
    assert_eq!(client.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_reconnect_authenticates_again() {
    let mut config = test_config();
    config.reconnect_delay = Duration::from_millis(10);
    let (client, relay, mut relays) = connect_client(config).await;
    let mut changes = client.state_changes();

    relay.close("restart").await;
    changes
        .wait_for(|state| *state == ConnectionState::Reconnecting)
        .await
        .unwrap();

    let mut relay = accept_handshake(&mut relays).await;
    wait_for_state(&client, ConnectionState::Connected).await;

    // The new link carries traffic
    let frame = Frame::message("m6", client.address(), "user1:d1", Vec::new());
    let relay_side = async {
        relay.recv_frame().await.unwrap().unwrap();
        relay.send(&Frame::ack("m6")).await.unwrap();
    };
    let (outcome, ()) = tokio::join!(client.send_and_await_ack(frame), relay_side);
    assert_eq!(outcome.unwrap(), Outcome::Completed(()));

    client.close().await;
}

#[tokio::test]
async fn test_close_releases_pending_waits() {
    let (client, mut relay, _relays) = connect_client(test_config()).await;

    let frame = Frame::message("m7", client.address(), "user1:d1", Vec::new());
    let closer = async {
        relay.recv_frame().await.unwrap().unwrap();
        assert_eq!(client.pending_waits().await, (1, 0));
        client.close().await;
    };

    let (outcome, ()) = tokio::join!(client.send_and_await_ack(frame), closer);
    assert_eq!(outcome.unwrap(), Outcome::Disconnected);
    assert_eq!(client.state(), ConnectionState::Closed);
    assert_eq!(client.pending_waits().await, (0, 0));

    // Closing twice is harmless
    client.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_auth_timeout() {
    let mut config = test_config();
    config.ack_timeout = Duration::from_secs(1);
    config.sweep_interval = Duration::from_millis(200);

    let (connector, mut relays) = MemoryConnector::new();
    let connecting = tokio::spawn(MessagingClient::connect(config, test_signer(), connector));

    // Accept the link but never answer the handshake
    let mut relay = recv_unbounded_timeout(&mut relays, DEFAULT_TEST_TIMEOUT)
        .await
        .unwrap();
    match relay.recv_frame().await {
        Some(Ok(Frame::Auth(auth))) => assert_eq!(auth.id, AUTH_ID),
        other => panic!("Expected AUTH frame, got {:?}", other),
    }

    let result = connecting.await.unwrap();
    assert!(matches!(result, Err(ClientError::AuthenticationTimeout)));
}

#[tokio::test(start_paused = true)]
async fn test_keepalive_pings_relay() {
    let mut config = test_config();
    config.ping_interval = Duration::from_secs(5);
    let (client, mut relay, _relays) = connect_client(config).await;

    tokio::time::advance(Duration::from_secs(6)).await;
    assert_eq!(
        relay.recv_raw().await,
        Some(selfid_core::core_router::Outbound::Ping)
    );

    client.close().await;
}

/// Drop the current link and read the AUTH frame of the next one, leaving
/// it unanswered
async fn reconnect_unauthenticated(
    client: &MessagingClient,
    relay: RelayEnd,
    relays: &mut tokio::sync::mpsc::UnboundedReceiver<RelayEnd>,
) -> RelayEnd {
    relay.close("restart").await;
    let mut relay = recv_unbounded_timeout(relays, DEFAULT_TEST_TIMEOUT).await.unwrap();
    match relay.recv_frame().await {
        Some(Ok(Frame::Auth(auth))) => assert_eq!(auth.id, AUTH_ID),
        other => panic!("Expected AUTH frame, got {:?}", other),
    }
    assert_eq!(client.state(), ConnectionState::Authenticating);
    relay
}

#[tokio::test]
async fn test_no_writes_before_reauthentication() {
    let mut config = test_config();
    config.reconnect_delay = Duration::from_millis(10);
    let (client, relay, mut relays) = connect_client(config).await;

    let mut relay = reconnect_unauthenticated(&client, relay, &mut relays).await;

    let early = Frame::message("early", client.address(), "user1:d1", Vec::new());
    let result = client.send_and_await_ack(early).await;
    assert!(matches!(result, Err(ClientError::NotConnected)));
    assert_eq!(client.pending_waits().await, (0, 0));

    // Nothing reached the relay ahead of the handshake ack
    relay.send(&Frame::ack(AUTH_ID)).await.unwrap();
    wait_for_state(&client, ConnectionState::Connected).await;

    let frame = Frame::message("m8", client.address(), "user1:d1", Vec::new());
    let relay_side = async {
        let received = relay.recv_frame().await.unwrap().unwrap();
        assert_eq!(received.id(), "m8");
        relay.send(&Frame::ack("m8")).await.unwrap();
    };
    let (outcome, ()) = tokio::join!(client.send_and_await_ack(frame), relay_side);
    assert_eq!(outcome.unwrap(), Outcome::Completed(()));

    client.close().await;
}

#[tokio::test]
async fn test_rejected_reauthentication_reconnects() {
    let mut config = test_config();
    config.reconnect_delay = Duration::from_millis(10);
    let (client, relay, mut relays) = connect_client(config).await;

    let relay = reconnect_unauthenticated(&client, relay, &mut relays).await;
    relay
        .send(&Frame::error(AUTH_ID, "relay", "token expired"))
        .await
        .unwrap();

    // The rejected link is abandoned and a fresh handshake follows
    let _relay = accept_handshake(&mut relays).await;
    wait_for_state(&client, ConnectionState::Connected).await;

    client.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_keepalive_drops_link() {
    let mut config = test_config();
    config.auto_reconnect = false;
    config.ping_interval = Duration::from_secs(5);
    let (client, mut relay, _relays) = connect_client(config).await;

    let frame = Frame::message("m9", client.address(), "user1:d1", Vec::new());
    let relay_side = async {
        relay.recv_frame().await.unwrap().unwrap();
        // The link stays open for reads, but pings can no longer be written
        relay.stop_reading();
        tokio::time::advance(Duration::from_secs(6)).await;
    };

    let (outcome, ()) = tokio::join!(client.send_and_await_ack(frame), relay_side);
    assert_eq!(outcome.unwrap(), Outcome::Disconnected);
    assert_eq!(client.state(), ConnectionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_failed_keepalive_reconnects() {
    let mut config = test_config();
    config.ping_interval = Duration::from_secs(5);
    config.reconnect_delay = Duration::from_secs(1);
    let (client, mut relay, mut relays) = connect_client(config).await;
    let mut changes = client.state_changes();

    relay.stop_reading();
    tokio::time::advance(Duration::from_secs(6)).await;
    changes
        .wait_for(|state| *state == ConnectionState::Reconnecting)
        .await
        .unwrap();

    let _relay = accept_handshake(&mut relays).await;
    wait_for_state(&client, ConnectionState::Connected).await;

    client.close().await;
}
