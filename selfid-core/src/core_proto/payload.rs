//! Application payloads carried inside signed envelopes.
//!
//! The body of every `MSG` frame is a JSON object whose `typ` field selects
//! one of a closed set of message kinds. Parsing never fails on an unknown
//! `typ`: it yields `AppMessage::Unknown` and leaves the decision to drop
//! the frame to the dispatcher.

use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use super::frame::WireMessage;
use crate::core_identity::{Envelope, IdentityError};

/// Timestamp format used by `iat` and `exp`
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Default lifetime of an outbound request
pub const DEFAULT_MESSAGE_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("Invalid envelope: {0}")]
    Envelope(#[from] IdentityError),

    #[error("Invalid {kind} payload: {reason}")]
    InvalidBody { kind: MessageKind, reason: String },
}

/// Known application message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    IdentityInfoRequest,
    IdentityInfoResponse,
    AuthenticationRequest,
    AuthenticationResponse,
}

impl MessageKind {
    pub const ALL: [MessageKind; 4] = [
        MessageKind::IdentityInfoRequest,
        MessageKind::IdentityInfoResponse,
        MessageKind::AuthenticationRequest,
        MessageKind::AuthenticationResponse,
    ];

    /// Value of the `typ` field
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::IdentityInfoRequest => "identity_info_req",
            MessageKind::IdentityInfoResponse => "identity_info_resp",
            MessageKind::AuthenticationRequest => "authentication_req",
            MessageKind::AuthenticationResponse => "authentication_resp",
        }
    }

    pub fn from_typ(typ: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == typ)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registered claims shared by every payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub typ: String,
    pub iss: String,
    #[serde(default)]
    pub sub: String,
    #[serde(default)]
    pub iat: String,
    #[serde(default)]
    pub exp: String,
    #[serde(default)]
    pub cid: String,
    #[serde(default)]
    pub jti: String,
}

impl Claims {
    /// Claims issued now, expiring after `ttl`, with a fresh `jti`
    pub fn new(
        kind: MessageKind,
        iss: impl Into<String>,
        sub: impl Into<String>,
        cid: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        let ttl = ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::hours(1));

        Self {
            typ: kind.as_str().to_string(),
            iss: iss.into(),
            sub: sub.into(),
            iat: now.format(TIMESTAMP_FORMAT).to_string(),
            exp: (now + ttl).format(TIMESTAMP_FORMAT).to_string(),
            cid: cid.into(),
            jti: Uuid::new_v4().to_string(),
        }
    }
}

/// A requested or shared fact (`{"fact": "email_address", ...}`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub fact: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Fact {
    pub fn named(fact: impl Into<String>) -> Self {
        Self {
            fact: fact.into(),
            value: None,
            extra: serde_json::Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityInfoRequest {
    #[serde(flatten)]
    pub claims: Claims,
    #[serde(default)]
    pub facts: Vec<Fact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl IdentityInfoRequest {
    pub fn new(iss: impl Into<String>, sub: impl Into<String>, facts: Vec<Fact>) -> Self {
        Self {
            claims: Claims::new(
                MessageKind::IdentityInfoRequest,
                iss,
                sub,
                Uuid::new_v4().to_string(),
                DEFAULT_MESSAGE_TTL,
            ),
            facts,
            description: None,
        }
    }

    /// Response sharing `facts` back to the requester on the same conversation
    pub fn respond(&self, facts: Vec<Fact>) -> IdentityInfoResponse {
        IdentityInfoResponse {
            claims: Claims::new(
                MessageKind::IdentityInfoResponse,
                self.claims.sub.clone(),
                self.claims.iss.clone(),
                self.claims.cid.clone(),
                DEFAULT_MESSAGE_TTL,
            ),
            facts,
            status: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityInfoResponse {
    #[serde(flatten)]
    pub claims: Claims,
    #[serde(default)]
    pub facts: Vec<Fact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl IdentityInfoResponse {
    pub fn fact(&self, name: &str) -> Option<&Fact> {
        self.facts.iter().find(|f| f.fact == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthenticationRequest {
    #[serde(flatten)]
    pub claims: Claims,
    #[serde(default)]
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
}

impl AuthenticationRequest {
    pub fn new(iss: impl Into<String>, sub: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            claims: Claims::new(
                MessageKind::AuthenticationRequest,
                iss,
                sub,
                Uuid::new_v4().to_string(),
                DEFAULT_MESSAGE_TTL,
            ),
            device_id: device_id.into(),
            aud: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthenticationResponse {
    #[serde(flatten)]
    pub claims: Claims,
    #[serde(default)]
    pub status: String,
}

impl AuthenticationResponse {
    pub fn accepted(&self) -> bool {
        self.status == "accepted"
    }
}

/// Parsed application body
#[derive(Debug, Clone, PartialEq)]
pub enum AppMessage {
    IdentityInfoRequest(IdentityInfoRequest),
    IdentityInfoResponse(IdentityInfoResponse),
    AuthenticationRequest(AuthenticationRequest),
    AuthenticationResponse(AuthenticationResponse),
    /// `typ` missing or not one of the known kinds
    Unknown { typ: Option<String> },
}

impl AppMessage {
    pub fn parse(body: &Value) -> Result<Self, PayloadError> {
        let typ = body.get("typ").and_then(Value::as_str);
        let kind = match typ.and_then(MessageKind::from_typ) {
            Some(kind) => kind,
            None => {
                return Ok(AppMessage::Unknown {
                    typ: typ.map(str::to_string),
                })
            }
        };

        let invalid = |e: serde_json::Error| PayloadError::InvalidBody {
            kind,
            reason: e.to_string(),
        };
        let body = body.clone();

        Ok(match kind {
            MessageKind::IdentityInfoRequest => {
                AppMessage::IdentityInfoRequest(serde_json::from_value(body).map_err(invalid)?)
            }
            MessageKind::IdentityInfoResponse => {
                AppMessage::IdentityInfoResponse(serde_json::from_value(body).map_err(invalid)?)
            }
            MessageKind::AuthenticationRequest => {
                AppMessage::AuthenticationRequest(serde_json::from_value(body).map_err(invalid)?)
            }
            MessageKind::AuthenticationResponse => {
                AppMessage::AuthenticationResponse(serde_json::from_value(body).map_err(invalid)?)
            }
        })
    }

    pub fn kind(&self) -> Option<MessageKind> {
        match self {
            AppMessage::IdentityInfoRequest(_) => Some(MessageKind::IdentityInfoRequest),
            AppMessage::IdentityInfoResponse(_) => Some(MessageKind::IdentityInfoResponse),
            AppMessage::AuthenticationRequest(_) => Some(MessageKind::AuthenticationRequest),
            AppMessage::AuthenticationResponse(_) => Some(MessageKind::AuthenticationResponse),
            AppMessage::Unknown { .. } => None,
        }
    }

    pub fn claims(&self) -> Option<&Claims> {
        match self {
            AppMessage::IdentityInfoRequest(m) => Some(&m.claims),
            AppMessage::IdentityInfoResponse(m) => Some(&m.claims),
            AppMessage::AuthenticationRequest(m) => Some(&m.claims),
            AppMessage::AuthenticationResponse(m) => Some(&m.claims),
            AppMessage::Unknown { .. } => None,
        }
    }
}

/// A `MSG` frame with its envelope and body decoded
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub id: String,
    pub sender: String,
    pub recipient: String,
    pub envelope: Envelope,
    pub body: Value,
    pub message: AppMessage,
}

impl InboundMessage {
    /// Decode envelope and body. The signature is not checked here.
    pub fn parse(frame: &WireMessage) -> Result<Self, PayloadError> {
        let envelope = Envelope::from_json(&frame.ciphertext)?;
        let body = envelope.decode_payload()?;
        let message = AppMessage::parse(&body)?;

        Ok(Self {
            id: frame.id.clone(),
            sender: frame.sender.clone(),
            recipient: frame.recipient.clone(),
            envelope,
            body,
            message,
        })
    }

    pub fn kind(&self) -> Option<MessageKind> {
        self.message.kind()
    }

    /// Conversation id, falling back to the frame id
    pub fn cid(&self) -> &str {
        match self.message.claims() {
            Some(claims) if !claims.cid.is_empty() => &claims.cid,
            _ => &self.id,
        }
    }

    /// Issuing identity, from the claims or else the frame sender
    pub fn issuer(&self) -> &str {
        match self.message.claims() {
            Some(claims) if !claims.iss.is_empty() => &claims.iss,
            _ => self.sender.split(':').next().unwrap_or(&self.sender),
        }
    }
}
