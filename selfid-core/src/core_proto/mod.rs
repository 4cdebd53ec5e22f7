//! Wire protocol
//!
//! - `frame` -> protobuf frames exchanged with the relay
//! - `codec` -> byte level encoding with size limits and typed decode errors
//! - `payload` -> application bodies carried inside signed envelopes

mod codec;
mod frame;
pub mod payload;

pub use codec::{decode_inbound, decode_outbound, encode, DecodeError, DEFAULT_MAX_FRAME_SIZE};
pub use frame::{AclCommand, Frame, MsgType, WireAcl, WireAuth, WireHeader, WireMessage};
pub use payload::{AppMessage, InboundMessage, MessageKind, PayloadError};
