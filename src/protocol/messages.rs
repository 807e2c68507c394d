//! Protocol message types for the chat system
//!
//! All message payloads that can be serialized/deserialized within frames.

use serde::{Deserialize, Serialize};

use crate::error::ChatError;
use crate::model::{
    ChatMessage, Identity, Role, Room, RoomKey, SessionId, UserSummary, ViewContext,
};

// =============================================================================
// Session control (0x00 - 0x0F)
// =============================================================================

/// First frame of a new participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Join {
    pub name: String,
    pub role: Role,
}

impl Join {
    pub fn identity(&self) -> Identity {
        Identity::new(self.name.clone(), self.role)
    }
}

/// First frame of a participant resuming after a transport drop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reconnect {
    pub name: String,
    pub role: Role,
}

impl Reconnect {
    pub fn identity(&self) -> Identity {
        Identity::new(self.name.clone(), self.role)
    }
}

/// Explicit logout
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Logout {}

/// Heartbeat sent by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    pub timestamp: u64,
}

/// Heartbeat answer, echoing the ping timestamp
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    pub timestamp: u64,
}

// =============================================================================
// Chat commands (0x10 - 0x1F) - Client -> Server
// =============================================================================

/// Switch the current room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRoom {
    pub room: RoomKey,
}

/// Report what the participant is looking at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetView {
    pub view: ViewContext,
}

/// Target fields as sent on the wire. Any combination may be present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<RoomKey>,
}

impl TargetFields {
    pub fn direct(recipient_id: impl Into<String>, recipient_name: impl Into<String>) -> Self {
        Self {
            recipient_id: Some(recipient_id.into()),
            recipient_name: Some(recipient_name.into()),
            room: None,
        }
    }

    pub fn room(room: impl Into<String>) -> Self {
        Self {
            room: Some(room.into()),
            ..Self::default()
        }
    }

    pub fn broadcast() -> Self {
        Self::default()
    }
}

/// Send a text message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessage {
    pub text: String,
    #[serde(flatten)]
    pub target: TargetFields,
    /// Client-supplied id; assigned by the server when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

/// Share a file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareFile {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub size_bytes: u64,
    /// Base64 data or a complete `data:` URL
    pub payload: String,
    #[serde(flatten)]
    pub target: TargetFields,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

// =============================================================================
// Queries (0x20 - 0x2F) - Client -> Server
// =============================================================================

/// Stored message lookup. `room` wins over the peer pair; neither means all.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<RoomKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_a: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_b: Option<String>,
    #[serde(default)]
    pub files_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

/// Newest shared files
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentFiles {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

/// Liveness probe
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Health {}

// =============================================================================
// Session state (0x30 - 0x3F) - Server -> Client
// =============================================================================

/// Join accepted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Joined {
    pub session_id: SessionId,
    pub name: String,
    pub role: Role,
    pub room: RoomKey,
}

/// Reconnect accepted under a new session id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reconnected {
    pub success: bool,
    pub session_id: SessionId,
}

/// Room directory snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomsInfo {
    pub rooms: Vec<Room>,
}

/// Live user list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsersList {
    pub users: Vec<UserSummary>,
}

/// History replayed on (re)join
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviousMessages {
    pub messages: Vec<ChatMessage>,
}

/// Room switch acknowledged
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomJoined {
    pub room: RoomKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<RoomKey>,
}

// =============================================================================
// Deliveries and presence (0x40 - 0x5F) - Server -> Client
// =============================================================================

/// A routed message. `confirmation` marks the sender's echo of a direct message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivered {
    pub message: ChatMessage,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub confirmation: bool,
}

/// Presence change of one participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presence {
    pub id: SessionId,
    pub name: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<RoomKey>,
    pub timestamp: u64,
}

// =============================================================================
// Query results (0x60 - 0x6F) - Server -> Client
// =============================================================================

/// Messages matching a query, or the newest files
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryResult {
    pub messages: Vec<ChatMessage>,
}

/// Health probe answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub healthy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub timestamp: u64,
}

// =============================================================================
// Error (0xFF)
// =============================================================================

/// Error reported to the client that caused it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Error {
    pub code: u32,
    pub message: String,
}

impl Error {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Rebuild the typed error on the receiving side
    pub fn to_chat_error(&self) -> ChatError {
        match self.code {
            1007 => ChatError::room_not_found(self.message.clone()),
            1008 => ChatError::permission_denied(self.message.clone()),
            1005 => ChatError::invalid_message(self.message.clone()),
            1003 => ChatError::protocol(self.message.clone()),
            _ => ChatError::internal(self.message.clone()),
        }
    }
}

impl From<&ChatError> for Error {
    fn from(err: &ChatError) -> Self {
        Self::new(err.code(), err.message())
    }
}
