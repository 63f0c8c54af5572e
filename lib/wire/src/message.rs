//! The closed union of message shapes that may cross the wire, and the validation that keeps it
//! closed: unknown fields, wrong types, malformed names, and empty or duplicate array elements
//! are all rejected the same way `serde_json` rejects a parse failure.

use lazy_static::lazy_static;
use regex::Regex;
use serde_derive::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::{MAX_FRAME_LEN, MAX_JSON_LEN, RESERVED_NICK};

lazy_static! {
    static ref NICK_RE: Regex = Regex::new(r"^[A-Za-z0-9]{1,10}$").unwrap();
    static ref CHANNEL_RE: Regex = Regex::new(r"^#[A-Za-z0-9]{1,10}$").unwrap();
}

/// A nickname that matched the nick regex and is not the reserved server identity.
#[inline]
pub fn is_valid_nick(nick: &str) -> bool {
    nick != RESERVED_NICK && NICK_RE.is_match(nick)
}

/// A channel name that matched the channel regex.
#[inline]
pub fn is_valid_channel(channel: &str) -> bool {
    CHANNEL_RE.is_match(channel)
}

fn is_unique<T: std::hash::Hash + Eq>(items: &[T]) -> bool {
    let set: HashSet<&T> = items.iter().collect();
    set.len() == items.len()
}

/// A message that failed JSON parsing or schema validation. Carries no detail beyond what the
/// Dispatcher needs: the original bytes become the body of the `schema` error sent back to the
/// connection.
#[derive(Debug)]
pub struct SchemaError;

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "message failed schema validation")
    }
}

impl std::error::Error for SchemaError {}

/// Commands travel client → server; the server reuses the same shapes for notifications it
/// originates (`nick`, `join`, `leave`, `quit`, `ping`, `pong`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
#[serde(deny_unknown_fields)]
pub enum Command {
    Nick {
        src: String,
        update: String,
    },
    Quit {
        src: String,
        msg: String,
    },
    Squit {
        src: String,
        msg: String,
    },
    Join {
        src: String,
        channels: Vec<String>,
    },
    Leave {
        src: String,
        channels: Vec<String>,
        msg: String,
    },
    Channels {
        src: String,
    },
    Users {
        src: String,
        channels: Vec<String>,
        #[serde(default)]
        client: bool,
    },
    Msg {
        src: String,
        targets: Vec<String>,
        msg: String,
    },
    Ping {
        src: String,
        msg: String,
    },
    Pong {
        src: String,
        msg: String,
    },
}

impl Command {
    /// The `src` field every command carries, prior to any server-side trust override.
    pub fn src(&self) -> &str {
        match self {
            Command::Nick { src, .. }
            | Command::Quit { src, .. }
            | Command::Squit { src, .. }
            | Command::Join { src, .. }
            | Command::Leave { src, .. }
            | Command::Channels { src, .. }
            | Command::Users { src, .. }
            | Command::Msg { src, .. }
            | Command::Ping { src, .. }
            | Command::Pong { src, .. } => src,
        }
    }

    /// Overwrites `src` with the connection's trusted identity. The server calls this before
    /// dispatch so a client can never forge another identity's commands.
    pub fn set_src(&mut self, trusted: &str) {
        let slot = match self {
            Command::Nick { src, .. }
            | Command::Quit { src, .. }
            | Command::Squit { src, .. }
            | Command::Join { src, .. }
            | Command::Leave { src, .. }
            | Command::Channels { src, .. }
            | Command::Users { src, .. }
            | Command::Msg { src, .. }
            | Command::Ping { src, .. }
            | Command::Pong { src, .. } => src,
        };
        *slot = trusted.to_string();
    }

    fn validate(&self) -> Result<(), SchemaError> {
        match self {
            // `update` is an unconstrained string at the schema layer; a malformed or reserved
            // nick is a `badnick` dispatch-level rejection (see `Directory::register`/`rename`),
            // not a schema failure.
            Command::Nick { .. } => {}
            Command::Join { channels, .. } => validate_channel_list(channels)?,
            Command::Leave { channels, .. } => validate_channel_list(channels)?,
            Command::Users { channels, .. } => validate_channel_list(channels)?,
            Command::Msg { targets, .. } => {
                if targets.is_empty() || !is_unique(targets) {
                    return Err(SchemaError);
                }
            }
            Command::Quit { .. }
            | Command::Squit { .. }
            | Command::Channels { .. }
            | Command::Ping { .. }
            | Command::Pong { .. } => {}
        }
        Ok(())
    }
}

fn validate_channel_list(channels: &[String]) -> Result<(), SchemaError> {
    if channels.is_empty() || !is_unique(channels) {
        return Err(SchemaError);
    }
    Ok(())
}

/// Replies travel server → client only, in response to an informational request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "lowercase")]
#[serde(deny_unknown_fields)]
pub enum Reply {
    Channels { channels: Vec<String> },
    Names { channel: String, names: Vec<String> },
}

/// The closed set of error kinds the server may report back to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    BadNick,
    NickInUse,
    Schema,
    NoChannel,
    BadChannel,
    NonMember,
    Member,
    NonExist,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorMessage {
    pub error: ErrorKind,
    pub msg: String,
}

/// The closed union of everything that may cross the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Command(Command),
    Reply(Reply),
    Error(ErrorMessage),
}

impl Message {
    /// Parses and validates one JSON frame. A message that round-trips through [`Message::encode`]
    /// always passes this check again.
    pub fn decode(bytes: &[u8]) -> Result<Message, SchemaError> {
        if bytes.len() > MAX_JSON_LEN {
            return Err(SchemaError);
        }
        let msg: Message = serde_json::from_slice(bytes).map_err(|_| SchemaError)?;
        if let Message::Command(cmd) = &msg {
            cmd.validate()?;
        }
        Ok(msg)
    }

    /// Serializes a message to compact JSON with no trailing CRLF; [`crate::codec`] owns framing.
    pub fn encode(&self) -> Result<Vec<u8>, SchemaError> {
        let bytes = serde_json::to_vec(self).map_err(|_| SchemaError)?;
        if bytes.len() > MAX_JSON_LEN || bytes.len() + 2 > MAX_FRAME_LEN {
            return Err(SchemaError);
        }
        Ok(bytes)
    }

    pub fn error(kind: ErrorKind, msg: impl Into<String>) -> Message {
        Message::Error(ErrorMessage {
            error: kind,
            msg: msg.into(),
        })
    }

    pub fn nick(src: impl Into<String>, update: impl Into<String>) -> Message {
        Message::Command(Command::Nick {
            src: src.into(),
            update: update.into(),
        })
    }

    pub fn quit(src: impl Into<String>, msg: impl Into<String>) -> Message {
        Message::Command(Command::Quit {
            src: src.into(),
            msg: msg.into(),
        })
    }

    pub fn join(src: impl Into<String>, channels: Vec<String>) -> Message {
        Message::Command(Command::Join {
            src: src.into(),
            channels,
        })
    }

    pub fn leave(src: impl Into<String>, channels: Vec<String>, msg: impl Into<String>) -> Message {
        Message::Command(Command::Leave {
            src: src.into(),
            channels,
            msg: msg.into(),
        })
    }

    pub fn msg(src: impl Into<String>, targets: Vec<String>, msg: impl Into<String>) -> Message {
        Message::Command(Command::Msg {
            src: src.into(),
            targets,
            msg: msg.into(),
        })
    }

    pub fn ping(src: impl Into<String>, nonce: impl Into<String>) -> Message {
        Message::Command(Command::Ping {
            src: src.into(),
            msg: nonce.into(),
        })
    }

    pub fn pong(src: impl Into<String>, nonce: impl Into<String>) -> Message {
        Message::Command(Command::Pong {
            src: src.into(),
            msg: nonce.into(),
        })
    }

    pub fn channels_reply(channels: Vec<String>) -> Message {
        Message::Reply(Reply::Channels { channels })
    }

    pub fn names_reply(channel: impl Into<String>, names: Vec<String>) -> Message {
        Message::Reply(Reply::Names {
            channel: channel.into(),
            names,
        })
    }
}
