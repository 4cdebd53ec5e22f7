/*
    MessagingClient - connection manager for one app identity

    Owns the link to the relay, both correlation registries and the observer
    tables. Three background tasks run per client:

        driver    -> connect, AUTH handshake, read loop, reconnect
        sweep     -> releases expired waits every `sweep_interval`
        keepalive -> writes a transport ping every `ping_interval`

    State machine (single writer: the driver, plus `close`):

        Disconnected -> Connecting -> Authenticating -> Connected
                            ^                               |
                            |        link lost              v
                       Reconnecting <---- auto_reconnect ---+
                                                            |
                        Closed <------ !auto_reconnect -----+

    `Closed` is terminal: every pending wait is released as `Disconnected`
    and the background tasks stop.
*/

use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::correlation::{CorrelationError, CorrelationRegistry, Outcome, Rejection};
use super::directory::{Directory, DirectoryError};
use super::dispatcher::{Dispatched, Dispatcher, Response, ACL_LIST_ID, AUTH_ID};
use super::metrics;
use super::observers::ObserverRegistry;
use super::transport::{Connector, Link, Outbound, TransportError, TransportEvent};
use crate::config::{ClientConfig, ConfigError};
use crate::core_identity::{verify, EnvelopeSigner, IdentityError};
use crate::core_proto::payload::{Claims, TIMESTAMP_FORMAT};
use crate::core_proto::{encode, AclCommand, Frame, InboundMessage, MessageKind};
use crate::shutdown::{ShutdownCoordinator, ShutdownHandler};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Correlation(#[from] CorrelationError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error("Relay did not acknowledge authentication in time")]
    AuthenticationTimeout,

    #[error("Relay rejected authentication: {0}")]
    AuthenticationRejected(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Not connected to the relay")]
    NotConnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
    Reconnecting,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Writable half of the current link
#[derive(Clone)]
struct LinkHandle {
    outbound: mpsc::Sender<Outbound>,
    /// Signalled by the keepalive task when a ping cannot be written
    lost: Arc<Notify>,
}

struct Inner {
    config: ClientConfig,
    signer: EnvelopeSigner,
    acks: Arc<CorrelationRegistry<()>>,
    responses: Arc<CorrelationRegistry<Response>>,
    observers: Arc<ObserverRegistry>,
    state: watch::Sender<ConnectionState>,
    link: Mutex<Option<LinkHandle>>,
    shutdown: ShutdownCoordinator,
}

impl Inner {
    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next || *current == ConnectionState::Closed {
                return false;
            }
            *current = next;
            true
        });

        if changed {
            info!(state = %next, "connection state changed");
            metrics::state_changed(next.as_str());
        }
    }

    async fn current_link(&self) -> Option<LinkHandle> {
        self.link.lock().await.clone()
    }

    /// Write an application frame; only an authenticated link accepts them
    async fn write(&self, frame: &Frame) -> Result<(), ClientError> {
        if *self.state.borrow() != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }
        let link = self.current_link().await.ok_or(ClientError::NotConnected)?;
        send_frame(&link.outbound, frame).await
    }

    /// Enter the terminal state; safe to call more than once
    async fn terminate(&self) {
        self.set_state(ConnectionState::Closed);

        if let Some(link) = self.link.lock().await.take() {
            let _ = link.outbound.try_send(Outbound::Close);
        }

        let released = self.acks.close_all().await + self.responses.close_all().await;
        if released > 0 {
            info!(released, "released pending waits on close");
        }
        let dropped = self.observers.clear().await;
        if dropped > 0 {
            debug!(dropped, "dropped conversation observers on close");
        }

        self.shutdown.shutdown().await;
    }
}

/// Client for the relay's messaging endpoint
pub struct MessagingClient {
    inner: Arc<Inner>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl MessagingClient {
    /// Connect and authenticate.
    ///
    /// Returns once the relay acknowledged the handshake, or fails when it
    /// rejects it, when `ack_timeout` elapses first, or when the link closes
    /// for good.
    pub async fn connect<C>(
        config: ClientConfig,
        signer: EnvelopeSigner,
        connector: C,
    ) -> Result<Self, ClientError>
    where
        C: Connector + 'static,
    {
        config.validate()?;

        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let inner = Arc::new(Inner {
            acks: Arc::new(CorrelationRegistry::new("acks", config.ack_timeout)),
            responses: Arc::new(CorrelationRegistry::new("responses", config.response_timeout)),
            observers: Arc::new(ObserverRegistry::new()),
            state,
            link: Mutex::new(None),
            shutdown: ShutdownCoordinator::new(),
            config,
            signer,
        });

        info!(url = %inner.config.url, app = %inner.signer.app_id(), "starting");
        let authenticated = inner.acks.begin_wait(AUTH_ID).await?;

        let connector: Arc<dyn Connector> = Arc::new(connector);
        let tasks = vec![
            tokio::spawn(
                ShutdownHandler::new(&inner.shutdown, "driver")
                    .run(drive(Arc::clone(&inner), connector)),
            ),
            tokio::spawn(
                ShutdownHandler::new(&inner.shutdown, "sweep").run(sweep(Arc::clone(&inner))),
            ),
            tokio::spawn(
                ShutdownHandler::new(&inner.shutdown, "keepalive")
                    .run(keepalive(Arc::clone(&inner))),
            ),
        ];

        let client = Self {
            inner,
            tasks: std::sync::Mutex::new(tasks),
        };

        match authenticated.wait().await {
            Outcome::Completed(()) => Ok(client),
            Outcome::TimedOut => {
                warn!("authentication timed out");
                client.close().await;
                Err(ClientError::AuthenticationTimeout)
            }
            Outcome::Rejected(rejection) => {
                warn!(reason = %rejection.reason, "authentication rejected");
                client.close().await;
                Err(ClientError::AuthenticationRejected(rejection.reason))
            }
            Outcome::Disconnected => {
                client.close().await;
                Err(ClientError::ConnectionClosed)
            }
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Watch connection state transitions
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Bearer token sent in the AUTH handshake
    pub fn auth_token(&self) -> &str {
        self.inner.signer.auth_token()
    }

    pub fn signer(&self) -> &EnvelopeSigner {
        &self.inner.signer
    }

    /// `<app id>:<device id>` as used in frame sender fields
    pub fn address(&self) -> String {
        format!("{}:{}", self.inner.signer.app_id(), self.inner.config.device_id)
    }

    /// Pending (ack, response) waits
    pub async fn pending_waits(&self) -> (usize, usize) {
        (
            self.inner.acks.pending_count().await,
            self.inner.responses.pending_count().await,
        )
    }

    /// One-shot conversation observers not yet fired
    pub async fn pending_observers(&self) -> usize {
        self.inner.observers.pending_count().await
    }

    /// Write a frame and wait for the relay's acknowledgement
    pub async fn send_and_await_ack(&self, frame: Frame) -> Result<Outcome<()>, ClientError> {
        let id = frame.id().to_string();
        let waiter = self.inner.acks.begin_wait(id.clone()).await?;

        if let Err(e) = self.inner.write(&frame).await {
            self.inner.acks.cancel(&id).await;
            return Err(e);
        }

        debug!(id = %id, "waiting for acknowledgement");
        Ok(waiter.wait().await)
    }

    /// Write a frame, wait for its ack, then for the response correlated by
    /// the frame id. A non-completed ack is returned as-is.
    pub async fn send_and_await_response(
        &self,
        frame: Frame,
    ) -> Result<Outcome<Response>, ClientError> {
        let id = frame.id().to_string();
        let response = self.inner.responses.begin_wait(id.clone()).await?;

        let ack = match self.send_and_await_ack(frame).await {
            Ok(ack) => ack,
            Err(e) => {
                self.inner.responses.cancel(&id).await;
                return Err(e);
            }
        };

        let abandoned = match ack {
            Outcome::Completed(()) => {
                debug!(id = %id, "waiting for response");
                return Ok(response.wait().await);
            }
            Outcome::Rejected(rejection) => Outcome::Rejected(rejection),
            Outcome::TimedOut => Outcome::TimedOut,
            Outcome::Disconnected => Outcome::Disconnected,
        };
        self.inner.responses.cancel(&id).await;
        Ok(abandoned)
    }

    /// Persistent observer for every unsolicited message of `kind`
    pub async fn subscribe<F>(&self, kind: MessageKind, callback: F)
    where
        F: Fn(InboundMessage) + Send + Sync + 'static,
    {
        self.inner.observers.subscribe(kind, callback).await;
    }

    /// One-shot observer for the next unsolicited message on conversation `cid`
    pub async fn set_observer<F>(&self, cid: impl Into<String>, callback: F)
    where
        F: FnOnce(InboundMessage) + Send + 'static,
    {
        self.inner.observers.set_observer(cid, callback).await;
    }

    /// Allow messages from `identity` (`"*"` allows everyone)
    pub async fn permit_connection(&self, identity: &str) -> Result<Outcome<()>, ClientError> {
        self.send_acl(AclCommand::Permit, identity).await
    }

    /// Block messages from `identity`
    pub async fn revoke_connection(&self, identity: &str) -> Result<Outcome<()>, ClientError> {
        self.send_acl(AclCommand::Revoke, identity).await
    }

    async fn send_acl(
        &self,
        command: AclCommand,
        identity: &str,
    ) -> Result<Outcome<()>, ClientError> {
        let now = chrono::Utc::now();
        let rule = self.inner.signer.sign(&json!({
            "iss": self.inner.signer.app_id(),
            "acl_source": identity,
            "jti": Uuid::new_v4().to_string(),
            "iat": now.format(TIMESTAMP_FORMAT).to_string(),
            "exp": (now + chrono::Duration::hours(1)).format(TIMESTAMP_FORMAT).to_string(),
        }));

        info!(identity = %identity, command = ?command, "updating ACL");
        let frame = Frame::acl(Uuid::new_v4().to_string(), command, rule.to_json().into_bytes());
        self.send_and_await_ack(frame).await
    }

    /// Rules currently configured on the relay
    pub async fn list_acl_rules(&self) -> Result<Outcome<Vec<String>>, ClientError> {
        let waiter = self.inner.responses.begin_wait(ACL_LIST_ID).await?;
        let frame = Frame::acl(Uuid::new_v4().to_string(), AclCommand::List, Vec::new());

        // The relay answers LIST directly, without an ack
        if let Err(e) = self.inner.write(&frame).await {
            self.inner.responses.cancel(ACL_LIST_ID).await;
            return Err(e);
        }

        Ok(waiter
            .wait()
            .await
            .map(|response| response.into_acl_list().unwrap_or_default()))
    }

    /// Send a signed message to one device of `recipient` and wait for the ack
    pub async fn share_information(
        &self,
        recipient: &str,
        recipient_device: &str,
        body: &Value,
    ) -> Result<Outcome<()>, ClientError> {
        let frame = self.signed_frame(
            Uuid::new_v4().to_string(),
            format!("{}:{}", recipient, recipient_device),
            body,
        );
        self.send_and_await_ack(frame).await
    }

    /// Send a signed request to the first device of `recipient` and wait for
    /// the response on the same conversation id
    pub async fn request(
        &self,
        recipient: &str,
        body: &Value,
        directory: &dyn Directory,
    ) -> Result<Outcome<InboundMessage>, ClientError> {
        let frame = self.request_frame(recipient, body, directory).await?;
        let outcome = self.send_and_await_response(frame).await?;

        Ok(match outcome {
            Outcome::Completed(Response::Message(message)) => Outcome::Completed(message),
            Outcome::Completed(Response::AclList(_)) => Outcome::Rejected(Rejection {
                id: conversation_id(body),
                sender: String::new(),
                reason: "unexpected ACL reply".to_string(),
            }),
            Outcome::Rejected(rejection) => Outcome::Rejected(rejection),
            Outcome::TimedOut => Outcome::TimedOut,
            Outcome::Disconnected => Outcome::Disconnected,
        })
    }

    /// Like `request`, but hand the response to `callback` instead of
    /// waiting for it. Returns the ack outcome.
    pub async fn request_with_callback<F>(
        &self,
        recipient: &str,
        body: &Value,
        directory: &dyn Directory,
        callback: F,
    ) -> Result<Outcome<()>, ClientError>
    where
        F: FnOnce(InboundMessage) + Send + 'static,
    {
        let frame = self.request_frame(recipient, body, directory).await?;
        let cid = frame.id().to_string();
        self.set_observer(cid.clone(), callback).await;

        let ack = self.send_and_await_ack(frame).await;
        if !matches!(ack, Ok(Outcome::Completed(()))) {
            self.inner.observers.remove(&cid).await;
        }
        ack
    }

    async fn request_frame(
        &self,
        recipient: &str,
        body: &Value,
        directory: &dyn Directory,
    ) -> Result<Frame, ClientError> {
        let devices = directory.devices(recipient).await?;
        let device = devices
            .first()
            .ok_or_else(|| DirectoryError::NoDevices(recipient.to_string()))?;

        Ok(self.signed_frame(
            conversation_id(body),
            format!("{}:{}", recipient, device),
            body,
        ))
    }

    fn signed_frame(&self, id: String, recipient: String, body: &Value) -> Frame {
        let envelope = self.inner.signer.sign(body);
        Frame::message(id, self.address(), recipient, envelope.to_json().into_bytes())
    }

    /// Check an inbound message's signature against its issuer's directory key
    pub async fn verify_message(
        &self,
        message: &InboundMessage,
        directory: &dyn Directory,
    ) -> Result<bool, ClientError> {
        let public_key = directory.public_key(message.issuer()).await?;
        Ok(verify(&message.envelope, &public_key))
    }

    /// Fresh claims issued by this app
    pub fn claims(&self, kind: MessageKind, sub: &str, cid: &str) -> Claims {
        Claims::new(
            kind,
            self.inner.signer.app_id(),
            sub,
            cid,
            crate::core_proto::payload::DEFAULT_MESSAGE_TTL,
        )
    }

    /// Stop background tasks, close the link and release every waiter
    pub async fn close(&self) {
        self.inner.terminate().await;

        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => Vec::new(),
        };
        for task in tasks {
            let _ = task.await;
        }
        info!("closed");
    }
}

impl Drop for MessagingClient {
    fn drop(&mut self) {
        if let Ok(tasks) = self.tasks.lock() {
            for task in tasks.iter() {
                task.abort();
            }
        }
    }
}

impl std::fmt::Debug for MessagingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagingClient")
            .field("url", &self.inner.config.url)
            .field("app_id", &self.inner.signer.app_id())
            .field("state", &self.state())
            .finish()
    }
}

/// `cid` of the body, or a fresh one
fn conversation_id(body: &Value) -> String {
    body.get("cid")
        .and_then(Value::as_str)
        .filter(|cid| !cid.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

async fn drive(inner: Arc<Inner>, connector: Arc<dyn Connector>) {
    let dispatcher = Dispatcher::new(
        Arc::clone(&inner.acks),
        Arc::clone(&inner.responses),
        Arc::clone(&inner.observers),
        inner.config.max_frame_size,
    );

    loop {
        inner.set_state(ConnectionState::Connecting);
        match connector.connect(&inner.config.url).await {
            Ok(link) => {
                let reason = run_link(&inner, &dispatcher, link).await;
                warn!(reason = %reason, "connection lost");
            }
            Err(e) => warn!("connection attempt failed: {}", e),
        }
        inner.link.lock().await.take();

        if !inner.config.auto_reconnect {
            inner.terminate().await;
            return;
        }

        inner.set_state(ConnectionState::Reconnecting);
        metrics::reconnect_attempted();
        tokio::time::sleep(inner.config.reconnect_delay).await;
        info!("reconnecting");
    }
}

/// Authenticate and pump inbound frames until the link goes away
async fn run_link(inner: &Inner, dispatcher: &Dispatcher, link: Link) -> String {
    let Link {
        outbound,
        mut inbound,
    } = link;
    let lost = Arc::new(Notify::new());

    inner.set_state(ConnectionState::Authenticating);
    *inner.link.lock().await = Some(LinkHandle {
        outbound: outbound.clone(),
        lost: Arc::clone(&lost),
    });

    // Written on the raw link: `write` refuses frames until authenticated
    let auth = Frame::auth(AUTH_ID, inner.signer.auth_token(), inner.config.device_id.clone());
    if let Err(e) = send_frame(&outbound, &auth).await {
        return format!("handshake not written: {}", e);
    }

    loop {
        tokio::select! {
            event = inbound.recv() => match event {
                Some(TransportEvent::Frame(bytes)) => match dispatcher.dispatch(&bytes).await {
                    Dispatched::Authenticated => {
                        inner.set_state(ConnectionState::Connected);
                        inner.acks.fulfill(AUTH_ID, ()).await;
                    }
                    Dispatched::AuthenticationRejected(reason) => {
                        warn!(reason = %reason, "relay rejected the handshake");
                        return format!("authentication rejected: {}", reason);
                    }
                    _ => {}
                },
                Some(TransportEvent::Closed { reason }) => return reason,
                None => return "link dropped".to_string(),
            },
            _ = lost.notified() => return "keepalive failed".to_string(),
        }
    }
}

async fn send_frame(outbound: &mpsc::Sender<Outbound>, frame: &Frame) -> Result<(), ClientError> {
    outbound
        .send(Outbound::Binary(encode(frame)))
        .await
        .map_err(|_| ClientError::NotConnected)?;

    metrics::frame_sent(frame.msg_type().as_str());
    debug!(id = %frame.id(), kind = %frame.msg_type(), "sent frame");
    Ok(())
}

async fn sweep(inner: Arc<Inner>) {
    let mut ticker = tokio::time::interval(inner.config.sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let now = Instant::now();
        let expired = inner.acks.sweep(now).await + inner.responses.sweep(now).await;
        if expired > 0 {
            debug!(expired, "released expired waits");
        }
    }
}

async fn keepalive(inner: Arc<Inner>) {
    let mut ticker = tokio::time::interval(inner.config.ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(link) = inner.current_link().await else {
            continue;
        };

        debug!("ping");
        if link.outbound.send(Outbound::Ping).await.is_err() {
            warn!("keepalive ping could not be written");
            metrics::keepalive_failed();
            link.lost.notify_one();
        }
    }
}
