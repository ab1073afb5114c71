//! # tandem-types
//!
//! Wire format types for the tandem hub/spoke control protocol.
//!
//! This crate provides the foundational types shared by the hub and the devices:
//! - [`ControlMessage`] - Tagged union of commands, acks, errors and events
//! - [`Request`] - Typed view of the commands a hub can issue
//! - [`ErrorCode`] - Command-level rejection codes
//! - [`SessionId`] - Session identity
//! - [`TransferHeader`] - Header line of the file transfer channel
//! - [`codec`] - Length-prefixed framing with a newline-delimited legacy fallback

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
mod error;
mod ids;
mod messages;

pub use codec::{
    decode_frame, encode, read_message, write_message, Framing, DEFAULT_MAX_FRAME_LEN,
};
pub use error::CodecError;
pub use ids::{safe_component, SessionId};
pub use messages::{
    Ack, Capabilities, Command, ControlMessage, ErrorCode, ErrorReply, Event, Heartbeat,
    PreviewFrame, Request, RequestError, TransferHeader, PROTOCOL_VERSION,
};
