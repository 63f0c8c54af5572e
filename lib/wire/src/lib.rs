//! The wire protocol shared by the chat server and any client: a closed set of JSON message
//! shapes (`message`), and the CRLF/LF line framing they travel in (`codec`).
//!
//! Nothing in this crate knows about sockets, nicknames held by other connections, or channel
//! membership — it only knows how to turn bytes into a validated [`Message`] and back.

pub mod codec;
pub mod message;

pub use codec::FrameCodec;
pub use message::{
    is_valid_channel, is_valid_nick, Command, ErrorKind, ErrorMessage, Message, Reply, SchemaError,
};

/// The reserved nickname server-originated messages are stamped with, and that no client may
/// register as their own.
pub const RESERVED_NICK: &str = "SERVER";

/// Maximum serialized JSON length of a single frame, excluding the CRLF/LF terminator.
pub const MAX_JSON_LEN: usize = 1022;

/// Maximum total framed size, including the terminator.
pub const MAX_FRAME_LEN: usize = 1024;
