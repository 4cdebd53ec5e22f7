/*
    Dispatcher - routes every inbound frame to its waiter or observer

    Runs inline on the read loop, so frames for one id are handled in the
    order they arrived. Nothing here returns an error: a frame that cannot be
    decoded or parsed is logged, counted and dropped, and the loop goes on.

    Routing by wire type:

        ERR -> reject the response wait and the ack wait for that id
        ACK -> fulfill the ack wait ("authentication" is reported back to
               the connection manager instead)
        ACL -> a JSON list in `recipient` fulfills the "acl_list" wait
        MSG -> parse envelope + body, then
                 pending response wait for the cid -> fulfill
                 otherwise                         -> observers
*/

use std::sync::Arc;
use tracing::{debug, info, warn};

use super::correlation::{CorrelationRegistry, Rejection};
use super::metrics;
use super::observers::ObserverRegistry;
use crate::core_proto::{decode_inbound, DecodeError, Frame, InboundMessage, MsgType, WireMessage};

/// Message id of the handshake frame and its acknowledgement
pub const AUTH_ID: &str = "authentication";

/// Correlation key for the relay's ACL list reply
pub const ACL_LIST_ID: &str = "acl_list";

/// Value delivered to a response wait
#[derive(Debug, Clone)]
pub enum Response {
    Message(InboundMessage),
    AclList(Vec<String>),
}

impl Response {
    pub fn into_message(self) -> Option<InboundMessage> {
        match self {
            Response::Message(message) => Some(message),
            Response::AclList(_) => None,
        }
    }

    pub fn into_acl_list(self) -> Option<Vec<String>> {
        match self {
            Response::AclList(rules) => Some(rules),
            Response::Message(_) => None,
        }
    }
}

/// What happened to one inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    /// The relay acknowledged the handshake
    Authenticated,
    /// Relay error for the handshake
    AuthenticationRejected(String),
    Acknowledged { id: String, waited: bool },
    Rejected { id: String, waited: bool },
    AclList { waited: bool },
    /// Delivered to a pending response wait
    Response { cid: String },
    /// Handed to an observer
    Observed { cid: String },
    /// Valid, but nobody was interested
    Unhandled { id: String },
    Dropped(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Empty,
    TooLarge,
    Malformed,
    UnknownType,
    InvalidPayload,
    UnknownKind,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::Empty => "empty",
            DropReason::TooLarge => "too_large",
            DropReason::Malformed => "malformed",
            DropReason::UnknownType => "unknown_type",
            DropReason::InvalidPayload => "invalid_payload",
            DropReason::UnknownKind => "unknown_kind",
        }
    }
}

impl From<&DecodeError> for DropReason {
    fn from(err: &DecodeError) -> Self {
        match err {
            DecodeError::Empty => DropReason::Empty,
            DecodeError::TooLarge { .. } => DropReason::TooLarge,
            DecodeError::Malformed(_) => DropReason::Malformed,
            DecodeError::UnknownType(_) => DropReason::UnknownType,
        }
    }
}

pub struct Dispatcher {
    acks: Arc<CorrelationRegistry<()>>,
    responses: Arc<CorrelationRegistry<Response>>,
    observers: Arc<ObserverRegistry>,
    max_frame_size: usize,
}

impl Dispatcher {
    pub fn new(
        acks: Arc<CorrelationRegistry<()>>,
        responses: Arc<CorrelationRegistry<Response>>,
        observers: Arc<ObserverRegistry>,
        max_frame_size: usize,
    ) -> Self {
        Self {
            acks,
            responses,
            observers,
            max_frame_size,
        }
    }

    pub async fn dispatch(&self, bytes: &[u8]) -> Dispatched {
        let frame = match decode_inbound(bytes, self.max_frame_size) {
            Ok(frame) => frame,
            Err(e) => {
                let reason = DropReason::from(&e);
                warn!(len = bytes.len(), "dropping undecodable frame: {}", e);
                metrics::decode_failure(reason.as_str());
                return Dispatched::Dropped(reason);
            }
        };

        let msg_type = frame.msg_type();
        metrics::frame_received(msg_type.as_str());
        debug!(id = %frame.id(), kind = %msg_type, "received frame");

        match frame {
            Frame::Message(message) => match msg_type {
                MsgType::Err => self.on_error(message).await,
                MsgType::Ack => self.on_ack(message).await,
                MsgType::Acl => self.on_acl(message).await,
                MsgType::Msg => self.on_message(message).await,
                MsgType::Auth => Dispatched::Unhandled { id: message.id },
            },
            // The relay never sends these
            Frame::Auth(auth) => Dispatched::Unhandled { id: auth.id },
            Frame::Acl(acl) => Dispatched::Unhandled { id: acl.id },
        }
    }

    async fn on_error(&self, message: WireMessage) -> Dispatched {
        let reason = String::from_utf8_lossy(&message.ciphertext).into_owned();
        warn!(id = %message.id, sender = %message.sender, reason = %reason, "relay error");

        let rejection = Rejection {
            id: message.id.clone(),
            sender: message.sender,
            reason,
        };

        let response_waited = self.responses.reject(&message.id, rejection.clone()).await;
        let ack_waited = self.acks.reject(&message.id, rejection.clone()).await;

        if message.id == AUTH_ID {
            return Dispatched::AuthenticationRejected(rejection.reason);
        }
        Dispatched::Rejected {
            id: message.id,
            waited: response_waited || ack_waited,
        }
    }

    async fn on_ack(&self, message: WireMessage) -> Dispatched {
        // The connection manager resolves the handshake wait itself, after
        // publishing the new state.
        if message.id == AUTH_ID {
            info!("authenticated with relay");
            return Dispatched::Authenticated;
        }

        let waited = self.acks.fulfill(&message.id, ()).await;
        debug!(id = %message.id, waited, "acknowledged");
        Dispatched::Acknowledged {
            id: message.id,
            waited,
        }
    }

    async fn on_acl(&self, message: WireMessage) -> Dispatched {
        match serde_json::from_str::<Vec<String>>(&message.recipient) {
            Ok(rules) => {
                debug!(count = rules.len(), "ACL list received");
                let waited = self.responses.fulfill(ACL_LIST_ID, Response::AclList(rules)).await;
                Dispatched::AclList { waited }
            }
            Err(_) => {
                debug!(id = %message.id, "ACL frame without a rule list");
                Dispatched::Unhandled { id: message.id }
            }
        }
    }

    async fn on_message(&self, message: WireMessage) -> Dispatched {
        let inbound = match InboundMessage::parse(&message) {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!(id = %message.id, sender = %message.sender, "dropping message: {}", e);
                metrics::payload_dropped(DropReason::InvalidPayload.as_str());
                return Dispatched::Dropped(DropReason::InvalidPayload);
            }
        };

        if inbound.kind().is_none() {
            warn!(
                id = %inbound.id,
                sender = %inbound.sender,
                typ = ?inbound.body.get("typ"),
                "dropping message of unknown kind"
            );
            metrics::payload_dropped(DropReason::UnknownKind.as_str());
            return Dispatched::Dropped(DropReason::UnknownKind);
        }

        let cid = inbound.cid().to_string();
        let inbound = match self.responses.offer(&cid, Response::Message(inbound)).await {
            Ok(()) => {
                debug!(cid = %cid, "response delivered");
                return Dispatched::Response { cid };
            }
            Err(Response::Message(inbound)) => inbound,
            Err(Response::AclList(_)) => return Dispatched::Unhandled { id: cid },
        };

        let id = inbound.id.clone();
        match self.observers.notify(inbound).await {
            Some(_) => Dispatched::Observed { cid },
            None => {
                debug!(id = %id, cid = %cid, "no observer for message");
                metrics::payload_dropped("no_observer");
                Dispatched::Unhandled { id }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_proto::{encode, MessageKind, WireHeader};
    use crate::core_router::correlation::Outcome;
    use crate::test_utils::fixtures::{message_frame, test_signer};
    use prost::Message as _;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Harness {
        acks: Arc<CorrelationRegistry<()>>,
        responses: Arc<CorrelationRegistry<Response>>,
        observers: Arc<ObserverRegistry>,
        dispatcher: Dispatcher,
    }

    fn harness() -> Harness {
        let acks = Arc::new(CorrelationRegistry::new("acks", Duration::from_secs(60)));
        let responses = Arc::new(CorrelationRegistry::new("responses", Duration::from_secs(120)));
        let observers = Arc::new(ObserverRegistry::new());
        let dispatcher = Dispatcher::new(
            Arc::clone(&acks),
            Arc::clone(&responses),
            Arc::clone(&observers),
            crate::core_proto::DEFAULT_MAX_FRAME_SIZE,
        );
        Harness {
            acks,
            responses,
            observers,
            dispatcher,
        }
    }

    #[tokio::test]
    async fn test_ack_fulfills_wait() {
        let h = harness();
        let waiter = h.acks.begin_wait("m1").await.unwrap();

        let result = h.dispatcher.dispatch(&encode(&Frame::ack("m1"))).await;
        assert_eq!(result, Dispatched::Acknowledged { id: "m1".to_string(), waited: true });
        assert_eq!(waiter.wait().await, Outcome::Completed(()));
    }

    #[tokio::test]
    async fn test_authentication_ack_is_reported_not_fulfilled() {
        let h = harness();
        let _auth = h.acks.begin_wait(AUTH_ID).await.unwrap();

        let result = h.dispatcher.dispatch(&encode(&Frame::ack(AUTH_ID))).await;
        assert_eq!(result, Dispatched::Authenticated);
        assert!(h.acks.contains(AUTH_ID).await);
    }

    #[tokio::test]
    async fn test_error_rejects_both_waits() {
        let h = harness();
        let response = h.responses.begin_wait("m2").await.unwrap();
        let ack = h.acks.begin_wait("m2").await.unwrap();

        let result = h
            .dispatcher
            .dispatch(&encode(&Frame::error("m2", "relay:0", "recipient unknown")))
            .await;
        assert_eq!(result, Dispatched::Rejected { id: "m2".to_string(), waited: true });

        for outcome in [ack.wait().await.map(|_| ()), response.wait().await.map(|_| ())] {
            match outcome {
                Outcome::Rejected(r) => {
                    assert_eq!(r.reason, "recipient unknown");
                    assert_eq!(r.sender, "relay:0");
                }
                other => panic!("Expected rejection, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_authentication_error() {
        let h = harness();
        let ack = h.acks.begin_wait(AUTH_ID).await.unwrap();
        let result = h
            .dispatcher
            .dispatch(&encode(&Frame::error(AUTH_ID, "relay:0", "bad token")))
            .await;

        assert_eq!(result, Dispatched::AuthenticationRejected("bad token".to_string()));
        assert!(matches!(ack.wait().await, Outcome::Rejected(_)));
    }

    #[tokio::test]
    async fn test_acl_list_fulfills_wait() {
        let h = harness();
        let waiter = h.responses.begin_wait(ACL_LIST_ID).await.unwrap();
        let rules = vec!["*".to_string()];

        let result = h.dispatcher.dispatch(&encode(&Frame::acl_list("x", &rules))).await;
        assert_eq!(result, Dispatched::AclList { waited: true });
        let list = waiter.wait().await.completed().and_then(Response::into_acl_list);
        assert_eq!(list, Some(rules));
    }

    #[tokio::test]
    async fn test_acl_without_list_is_silent() {
        let h = harness();
        let frame = Frame::Message(WireMessage {
            r#type: MsgType::Acl as i32,
            id: "acl-1".to_string(),
            sender: String::new(),
            recipient: "not a list".to_string(),
            ciphertext: Vec::new(),
        });
        let result = h.dispatcher.dispatch(&encode(&frame)).await;
        assert_eq!(result, Dispatched::Unhandled { id: "acl-1".to_string() });
    }

    #[tokio::test]
    async fn test_message_fulfills_response_wait_by_cid() {
        let h = harness();
        let signer = test_signer();
        let waiter = h.responses.begin_wait("conv-1").await.unwrap();

        let frame = message_frame(
            &signer,
            "frame-9",
            &json!({"typ": "identity_info_resp", "iss": "user1", "cid": "conv-1"}),
        );
        let result = h.dispatcher.dispatch(&encode(&frame)).await;
        assert_eq!(result, Dispatched::Response { cid: "conv-1".to_string() });

        let message = waiter.wait().await.completed().and_then(Response::into_message).unwrap();
        assert_eq!(message.id, "frame-9");
        assert_eq!(message.kind(), Some(MessageKind::IdentityInfoResponse));
    }

    #[tokio::test]
    async fn test_message_without_wait_goes_to_observer() {
        let h = harness();
        let signer = test_signer();
        let (tx, mut rx) = mpsc::unbounded_channel();
        h.observers
            .subscribe(MessageKind::AuthenticationResponse, move |msg| {
                let _ = tx.send(msg.cid().to_string());
            })
            .await;

        let frame = message_frame(
            &signer,
            "frame-3",
            &json!({"typ": "authentication_resp", "iss": "user1", "cid": "c3", "status": "accepted"}),
        );
        let result = h.dispatcher.dispatch(&encode(&frame)).await;
        assert_eq!(result, Dispatched::Observed { cid: "c3".to_string() });
        assert_eq!(rx.recv().await.as_deref(), Some("c3"));
    }

    #[tokio::test]
    async fn test_unknown_kind_is_dropped_without_side_effects() {
        let h = harness();
        let signer = test_signer();
        let waiter = h.responses.begin_wait("c4").await.unwrap();

        let frame = message_frame(&signer, "c4", &json!({"typ": "chat", "iss": "user1", "cid": "c4"}));
        let result = h.dispatcher.dispatch(&encode(&frame)).await;
        assert_eq!(result, Dispatched::Dropped(DropReason::UnknownKind));

        // The wait is untouched
        assert!(h.responses.contains("c4").await);
        h.responses.cancel("c4").await;
        drop(waiter);
    }

    #[tokio::test]
    async fn test_garbage_is_dropped() {
        let h = harness();
        assert_eq!(h.dispatcher.dispatch(&[]).await, Dispatched::Dropped(DropReason::Empty));
        assert_eq!(
            h.dispatcher.dispatch(&[0xFF, 0xFF, 0xFF]).await,
            Dispatched::Dropped(DropReason::Malformed)
        );

        let unknown = WireHeader {
            r#type: 9,
            id: "x".to_string(),
        }
        .encode_to_vec();
        assert_eq!(
            h.dispatcher.dispatch(&unknown).await,
            Dispatched::Dropped(DropReason::UnknownType)
        );

        let bad_envelope = Frame::message("m", "a:1", "b:1", b"{}".to_vec());
        assert_eq!(
            h.dispatcher.dispatch(&encode(&bad_envelope)).await,
            Dispatched::Dropped(DropReason::InvalidPayload)
        );
    }
}
