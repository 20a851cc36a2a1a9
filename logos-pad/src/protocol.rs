//! JSON envelope protocol for plain-text collaboration.
//!
//! Every frame is a single JSON object tagged by `type`:
//! ```text
//! { "type": "text_change", "content": "…", "userId": "…", "username": "…", "timestamp": 1700000000000 }
//! ```
//!
//! Outbound messages are built as [`Envelope`] values and serialized once per
//! fan-out. Inbound frames are decoded into an [`Inbound`], which keeps the raw
//! JSON object alongside the typed [`ClientMessage`] so that relayed frames
//! carry every field the sender wrote.
//!
//! All timestamps are milliseconds since the Unix epoch.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_tungstenite::tungstenite::Utf8Bytes;
use uuid::Uuid;

/// Server-assigned connection identity.
pub type UserId = Uuid;

/// Document identifier, supplied by the client or generated on join.
pub type DocId = String;

/// A serialized frame, shared by every recipient of a fan-out.
///
/// Reference-counted bytes: cloning per recipient and handing the frame to the
/// socket never copies the text.
pub type Payload = Utf8Bytes;

/// Title given to documents created on first join.
pub const DEFAULT_TITLE: &str = "Untitled Document";

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Message kinds understood by the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Initial snapshot sent once to a new connection
    Init,
    /// Display-name update from a client
    UsernameChange,
    /// Whole-content replacement from a client
    TextChange,
    /// Caret movement, relayed without state change
    CursorPosition,
    /// Explicit save request
    Save,
    /// Acknowledgement of a save, sender only
    SaveSuccess,
    /// Document title change
    Rename,
    /// Presence transition: member arrived (or renamed)
    UserJoined,
    /// Presence transition: member departed
    UserLeft,
    /// Full presence snapshot
    UsersList,
    /// Rejection notice for an unrecognized request
    Error,
}

impl MessageKind {
    pub const ALL: [MessageKind; 11] = [
        MessageKind::Init,
        MessageKind::UsernameChange,
        MessageKind::TextChange,
        MessageKind::CursorPosition,
        MessageKind::Save,
        MessageKind::SaveSuccess,
        MessageKind::Rename,
        MessageKind::UserJoined,
        MessageKind::UserLeft,
        MessageKind::UsersList,
        MessageKind::Error,
    ];

    /// Wire name used in the `type` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::UsernameChange => "username_change",
            Self::TextChange => "text_change",
            Self::CursorPosition => "cursor_position",
            Self::Save => "save",
            Self::SaveSuccess => "save_success",
            Self::Rename => "rename",
            Self::UserJoined => "user_joined",
            Self::UserLeft => "user_left",
            Self::UsersList => "users_list",
            Self::Error => "error",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

/// Public identity of a room member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMeta {
    #[serde(rename = "userId")]
    pub user_id: UserId,
    pub username: String,
}

impl UserMeta {
    pub fn new(user_id: UserId, username: impl Into<String>) -> Self {
        Self {
            user_id,
            username: username.into(),
        }
    }
}

/// The structured unit exchanged over a connection.
///
/// Empty strings and absent optionals are omitted on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(rename = "userId", default, skip_serializing_if = "String::is_empty")]
    pub user_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    /// Caret offset in characters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub users: Option<Vec<UserMeta>>,
    /// Milliseconds since the Unix epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl Envelope {
    /// Bare envelope of the given kind, stamped with the current time.
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind: kind.as_str().to_owned(),
            timestamp: Some(now_millis()),
            ..Self::default()
        }
    }

    /// Snapshot reply for a freshly joined connection.
    pub fn init(user_id: UserId, title: &str, content: &str, users: Vec<UserMeta>) -> Self {
        Self {
            content: content.to_owned(),
            title: title.to_owned(),
            user_id: user_id.to_string(),
            users: Some(users),
            ..Self::new(MessageKind::Init)
        }
    }

    pub fn user_joined(user_id: UserId, username: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            username: username.to_owned(),
            ..Self::new(MessageKind::UserJoined)
        }
    }

    pub fn user_left(user_id: UserId, username: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            username: username.to_owned(),
            ..Self::new(MessageKind::UserLeft)
        }
    }

    pub fn users_list(users: Vec<UserMeta>) -> Self {
        Self {
            users: Some(users),
            ..Self::new(MessageKind::UsersList)
        }
    }

    pub fn save_success() -> Self {
        Self::new(MessageKind::SaveSuccess)
    }

    /// Title change, attributed to the member who requested it.
    pub fn rename(title: &str, user_id: UserId) -> Self {
        Self {
            title: title.to_owned(),
            user_id: user_id.to_string(),
            ..Self::new(MessageKind::Rename)
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::new(MessageKind::Error)
        }
    }

    /// Typed kind, if the `type` field names a known message.
    pub fn message_kind(&self) -> Option<MessageKind> {
        MessageKind::parse(&self.kind)
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<Payload, ProtocolError> {
        serde_json::to_string(self)
            .map(Payload::from)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from a JSON text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

/// Client requests, keyed by `type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    UsernameChange { username: String },
    TextChange { content: String },
    CursorPosition,
    Save { content: String },
    Rename { title: String },
    /// Any `type` the hub does not accept from clients.
    Unknown(String),
}

/// The JSON object of an inbound frame, kept for relaying.
#[derive(Debug, Clone)]
pub struct RawEnvelope(Map<String, Value>);

impl RawEnvelope {
    /// Overwrite the server-owned fields and serialize.
    ///
    /// Every other field the client wrote is relayed untouched.
    pub fn stamp(mut self, user_id: UserId, username: &str, timestamp: i64) -> Result<Payload, ProtocolError> {
        self.0.insert("userId".to_owned(), Value::String(user_id.to_string()));
        self.0.insert("username".to_owned(), Value::String(username.to_owned()));
        self.0.insert("timestamp".to_owned(), Value::from(timestamp));
        serde_json::to_string(&self.0)
            .map(Payload::from)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

/// A decoded client frame.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub message: ClientMessage,
    pub raw: RawEnvelope,
}

impl Inbound {
    /// Decode a text frame.
    ///
    /// Fails on anything that is not a JSON object with a string `type`, or
    /// when a text field the kind relies on holds a non-string value.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Decode(e.to_string()))?;
        let Value::Object(raw) = value else {
            return Err(ProtocolError::NotAnObject);
        };
        let kind = match raw.get("type") {
            Some(Value::String(kind)) => kind.clone(),
            _ => return Err(ProtocolError::MissingKind),
        };

        let message = match MessageKind::parse(&kind) {
            Some(MessageKind::UsernameChange) => ClientMessage::UsernameChange {
                username: string_field(&raw, "username")?,
            },
            Some(MessageKind::TextChange) => ClientMessage::TextChange {
                content: string_field(&raw, "content")?,
            },
            Some(MessageKind::CursorPosition) => ClientMessage::CursorPosition,
            Some(MessageKind::Save) => ClientMessage::Save {
                content: string_field(&raw, "content")?,
            },
            Some(MessageKind::Rename) => ClientMessage::Rename {
                title: string_field(&raw, "title")?,
            },
            _ => ClientMessage::Unknown(kind),
        };

        Ok(Self {
            message,
            raw: RawEnvelope(raw),
        })
    }
}

/// Absent and `null` read as the empty string.
fn string_field(raw: &Map<String, Value>, key: &'static str) -> Result<String, ProtocolError> {
    match raw.get(key) {
        None | Some(Value::Null) => Ok(String::new()),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(ProtocolError::InvalidField(key)),
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed envelope: {0}")]
    Decode(String),
    #[error("Envelope is not a JSON object")]
    NotAnObject,
    #[error("Envelope has no message type")]
    MissingKind,
    #[error("Field '{0}' must be a string")]
    InvalidField(&'static str),
    #[error("Serialization error: {0}")]
    Serialization(String),
}
