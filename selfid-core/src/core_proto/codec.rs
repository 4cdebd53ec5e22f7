//! Frame encoding and decoding.
//!
//! Encoding is purely structural. Decoding keeps three failure classes
//! apart so the dispatcher can log them precisely: empty input, bytes that
//! are not a valid frame, and well-formed frames of an unknown kind.

use prost::Message;
use thiserror::Error;

use super::frame::{Frame, MsgType, WireAcl, WireAuth, WireHeader, WireMessage};

/// Frames above this size are rejected before decoding (1 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Empty frame")]
    Empty,

    #[error("Frame too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("Malformed frame: {0}")]
    Malformed(#[from] prost::DecodeError),

    #[error("Unknown message type: {0}")]
    UnknownType(i32),
}

pub fn encode(frame: &Frame) -> Vec<u8> {
    match frame {
        Frame::Auth(f) => f.encode_to_vec(),
        Frame::Message(f) => f.encode_to_vec(),
        Frame::Acl(f) => f.encode_to_vec(),
    }
}

/// Decode a frame sent by the relay.
///
/// The relay answers ACL commands with a plain message frame (the rule list
/// travels in `recipient`), so everything but AUTH decodes as a message.
pub fn decode_inbound(bytes: &[u8], max_frame_size: usize) -> Result<Frame, DecodeError> {
    match peek_type(bytes, max_frame_size)? {
        MsgType::Auth => Ok(Frame::Auth(WireAuth::decode(bytes)?)),
        MsgType::Msg | MsgType::Ack | MsgType::Err | MsgType::Acl => {
            Ok(Frame::Message(WireMessage::decode(bytes)?))
        }
    }
}

/// Decode a frame written by a client, as the relay sees it
pub fn decode_outbound(bytes: &[u8], max_frame_size: usize) -> Result<Frame, DecodeError> {
    match peek_type(bytes, max_frame_size)? {
        MsgType::Auth => Ok(Frame::Auth(WireAuth::decode(bytes)?)),
        MsgType::Acl => Ok(Frame::Acl(WireAcl::decode(bytes)?)),
        MsgType::Msg | MsgType::Ack | MsgType::Err => {
            Ok(Frame::Message(WireMessage::decode(bytes)?))
        }
    }
}

fn peek_type(bytes: &[u8], max_frame_size: usize) -> Result<MsgType, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    if bytes.len() > max_frame_size {
        return Err(DecodeError::TooLarge {
            size: bytes.len(),
            max: max_frame_size,
        });
    }

    let header = WireHeader::decode(bytes)?;
    MsgType::try_from(header.r#type).map_err(|_| DecodeError::UnknownType(header.r#type))
}
