/*
  Transport - duplex byte link to the relay

  The connection manager never touches sockets. It asks a `Connector` for a
  `Link`, writes `Outbound` commands into it and reads `TransportEvent`s out
  of it. One link per connection attempt; a reconnect asks for a new one.

  Implementations:
    - WebSocketConnector -> tokio-tungstenite client, binary frames
    - MemoryConnector    -> in-process pair for tests; every connect hands
                            the far end (`RelayEnd`) to the test

┌─────────────────────────────────────────────────────────┐
│                          Link                           │
├─────────────────────────────────────────────────────────┤
│  outbound (to relay):                                   │
│    • Binary(bytes) ──► Writer Task ──► socket           │
│    • Ping          ──► Writer Task ──► ping frame       │
│    • Close         ──► Writer Task ──► close frame      │
│                                                         │
│  inbound (from relay):                                  │
│    • Frame(bytes)  ◄── Reader Task ◄── binary message   │
│    • Closed        ◄── Reader Task ◄── close / error    │
└─────────────────────────────────────────────────────────┘
*/

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::core_proto::{decode_outbound, encode, DecodeError, Frame, DEFAULT_MAX_FRAME_SIZE};

/// Capacity of each direction of a link
pub const LINK_BUFFER: usize = 256;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("Link closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Binary(Vec<u8>),
    Ping,
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Frame(Vec<u8>),
    Closed { reason: String },
}

/// Both directions of an open connection
#[derive(Debug)]
pub struct Link {
    pub outbound: mpsc::Sender<Outbound>,
    pub inbound: mpsc::Receiver<TransportEvent>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Link, TransportError>;
}

/// WebSocket client transport
#[derive(Debug, Default, Clone)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<Link, TransportError> {
        let (ws_stream, _response) =
            tokio_tungstenite::connect_async(url)
                .await
                .map_err(|e| TransportError::Connect {
                    url: url.to_string(),
                    reason: e.to_string(),
                })?;
        debug!(url = %url, "websocket connection established");

        let (mut write, mut read) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(LINK_BUFFER);
        let (in_tx, in_rx) = mpsc::channel::<TransportEvent>(LINK_BUFFER);

        // Writer task
        tokio::spawn(async move {
            while let Some(command) = out_rx.recv().await {
                let (message, closing) = match command {
                    Outbound::Binary(bytes) => (Message::Binary(bytes), false),
                    Outbound::Ping => (Message::Ping(Vec::new()), false),
                    Outbound::Close => (Message::Close(None), true),
                };
                if let Err(e) = write.send(message).await {
                    warn!("websocket write failed: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = write.close().await;
        });

        // Reader task
        tokio::spawn(async move {
            let reason = loop {
                match read.next().await {
                    Some(Ok(Message::Binary(data))) => {
                        if in_tx.send(TransportEvent::Frame(data)).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        warn!(len = text.len(), "ignoring text frame from relay");
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break frame
                            .map(|f| format!("{} {}", f.code, f.reason))
                            .unwrap_or_else(|| "closed by relay".to_string());
                    }
                    // Pongs are queued by tungstenite itself
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => break e.to_string(),
                    None => break "stream ended".to_string(),
                }
            };
            let _ = in_tx.send(TransportEvent::Closed { reason }).await;
        });

        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

/// In-process connector; each successful `connect` yields a `RelayEnd`
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    relay_tx: mpsc::UnboundedSender<RelayEnd>,
}

impl MemoryConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RelayEnd>) {
        let (relay_tx, relay_rx) = mpsc::unbounded_channel();
        (Self { relay_tx }, relay_rx)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, url: &str) -> Result<Link, TransportError> {
        let (out_tx, out_rx) = mpsc::channel(LINK_BUFFER);
        let (in_tx, in_rx) = mpsc::channel(LINK_BUFFER);

        self.relay_tx
            .send(RelayEnd {
                url: url.to_string(),
                from_client: out_rx,
                to_client: in_tx,
            })
            .map_err(|_| TransportError::Connect {
                url: url.to_string(),
                reason: "relay is not accepting connections".to_string(),
            })?;

        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

/// Relay side of a memory link. Dropping it closes the link.
#[derive(Debug)]
pub struct RelayEnd {
    pub url: String,
    from_client: mpsc::Receiver<Outbound>,
    to_client: mpsc::Sender<TransportEvent>,
}

impl RelayEnd {
    /// Next raw command written by the client, pings included
    pub async fn recv_raw(&mut self) -> Option<Outbound> {
        self.from_client.recv().await
    }

    /// Next frame written by the client, skipping pings
    pub async fn recv_frame(&mut self) -> Option<Result<Frame, DecodeError>> {
        loop {
            match self.from_client.recv().await? {
                Outbound::Binary(bytes) => {
                    return Some(decode_outbound(&bytes, DEFAULT_MAX_FRAME_SIZE))
                }
                Outbound::Ping => continue,
                Outbound::Close => return None,
            }
        }
    }

    /// Stop accepting client writes while the link stays open for reads;
    /// every later write on the client side fails
    pub fn stop_reading(&mut self) {
        self.from_client.close();
    }

    pub async fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        self.send_raw(encode(frame)).await
    }

    pub async fn send_raw(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.to_client
            .send(TransportEvent::Frame(bytes))
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Close the link with a reason visible to the client
    pub async fn close(self, reason: &str) {
        let _ = self
            .to_client
            .send(TransportEvent::Closed {
                reason: reason.to_string(),
            })
            .await;
    }
}
