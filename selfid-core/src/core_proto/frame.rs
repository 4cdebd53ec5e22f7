//! Protobuf frames exchanged with the relay.
//!
//! Every frame starts with the same two fields (`type` = 1, `id` = 2), which
//! lets the codec peek at the kind before decoding the full body.

/// Wire message kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum MsgType {
    Auth = 0,
    Msg = 1,
    Ack = 2,
    Err = 3,
    Acl = 4,
}

impl MsgType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MsgType::Auth => "AUTH",
            MsgType::Msg => "MSG",
            MsgType::Ack => "ACK",
            MsgType::Err => "ERR",
            MsgType::Acl => "ACL",
        }
    }
}

impl std::fmt::Display for MsgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// ACL sub-commands
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum AclCommand {
    Permit = 0,
    Revoke = 1,
    List = 2,
}

/// Common prefix of every frame
#[derive(Clone, PartialEq, prost::Message)]
pub struct WireHeader {
    #[prost(enumeration = "MsgType", tag = "1")]
    pub r#type: i32,
    #[prost(string, tag = "2")]
    pub id: String,
}

/// `MSG`, `ACK`, `ERR` and relay `ACL` replies
#[derive(Clone, PartialEq, prost::Message)]
pub struct WireMessage {
    #[prost(enumeration = "MsgType", tag = "1")]
    pub r#type: i32,
    #[prost(string, tag = "2")]
    pub id: String,
    /// `<identity>:<device>`
    #[prost(string, tag = "3")]
    pub sender: String,
    /// `<identity>:<device>`; carries the JSON rule list on ACL replies
    #[prost(string, tag = "4")]
    pub recipient: String,
    #[prost(bytes = "vec", tag = "5")]
    pub ciphertext: Vec<u8>,
}

/// Handshake frame
#[derive(Clone, PartialEq, prost::Message)]
pub struct WireAuth {
    #[prost(enumeration = "MsgType", tag = "1")]
    pub r#type: i32,
    #[prost(string, tag = "2")]
    pub id: String,
    #[prost(string, tag = "3")]
    pub token: String,
    #[prost(string, tag = "4")]
    pub device: String,
    #[prost(int64, tag = "5")]
    pub offset: i64,
}

/// Outbound ACL command
#[derive(Clone, PartialEq, prost::Message)]
pub struct WireAcl {
    #[prost(enumeration = "MsgType", tag = "1")]
    pub r#type: i32,
    #[prost(string, tag = "2")]
    pub id: String,
    #[prost(enumeration = "AclCommand", tag = "3")]
    pub command: i32,
    #[prost(bytes = "vec", tag = "4")]
    pub payload: Vec<u8>,
}

/// A decoded frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Auth(WireAuth),
    Message(WireMessage),
    Acl(WireAcl),
}

impl Frame {
    pub fn auth(id: impl Into<String>, token: impl Into<String>, device: impl Into<String>) -> Self {
        Frame::Auth(WireAuth {
            r#type: MsgType::Auth as i32,
            id: id.into(),
            token: token.into(),
            device: device.into(),
            offset: 0,
        })
    }

    pub fn message(
        id: impl Into<String>,
        sender: impl Into<String>,
        recipient: impl Into<String>,
        ciphertext: Vec<u8>,
    ) -> Self {
        Self::with_type(MsgType::Msg, id, sender, recipient, ciphertext)
    }

    pub fn ack(id: impl Into<String>) -> Self {
        Self::with_type(MsgType::Ack, id, "", "", Vec::new())
    }

    /// Relay error frame; `reason` travels in the ciphertext field
    pub fn error(id: impl Into<String>, sender: impl Into<String>, reason: &str) -> Self {
        Self::with_type(MsgType::Err, id, sender, "", reason.as_bytes().to_vec())
    }

    /// Relay reply to an ACL LIST command
    pub fn acl_list(id: impl Into<String>, rules: &[String]) -> Self {
        let recipient = serde_json::Value::from(rules.to_vec()).to_string();
        Self::with_type(MsgType::Acl, id, "", recipient, Vec::new())
    }

    pub fn acl(id: impl Into<String>, command: AclCommand, payload: Vec<u8>) -> Self {
        Frame::Acl(WireAcl {
            r#type: MsgType::Acl as i32,
            id: id.into(),
            command: command as i32,
            payload,
        })
    }

    fn with_type(
        msg_type: MsgType,
        id: impl Into<String>,
        sender: impl Into<String>,
        recipient: impl Into<String>,
        ciphertext: Vec<u8>,
    ) -> Self {
        Frame::Message(WireMessage {
            r#type: msg_type as i32,
            id: id.into(),
            sender: sender.into(),
            recipient: recipient.into(),
            ciphertext,
        })
    }

    /// Kind of the frame; out-of-range discriminants never reach a `Frame`
    pub fn msg_type(&self) -> MsgType {
        match self {
            Frame::Auth(f) => f.r#type(),
            Frame::Message(f) => f.r#type(),
            Frame::Acl(f) => f.r#type(),
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Frame::Auth(f) => &f.id,
            Frame::Message(f) => &f.id,
            Frame::Acl(f) => &f.id,
        }
    }
}
