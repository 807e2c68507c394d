//! Domain types shared by the server, the client and the message store

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ChatError;

/// Transport-assigned connection id, unique per live connection
pub type SessionId = String;

/// Room key, e.g. `general`
pub type RoomKey = String;

/// Participant role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Student,
    Lecturer,
    Admin,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Student, Role::Lecturer, Role::Admin];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Lecturer => "lecturer",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "student" => Ok(Role::Student),
            "lecturer" => Ok(Role::Lecturer),
            "admin" => Ok(Role::Admin),
            other => Err(ChatError::invalid_message(format!("Unknown role: {}", other))),
        }
    }
}

/// The name+role pair a reconnecting participant is matched on
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub role: Role,
}

impl Identity {
    pub fn new(name: impl Into<String>, role: Role) -> Self {
        Self {
            name: name.into(),
            role,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.role)
    }
}

/// Room definition. Loaded once and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub key: RoomKey,
    pub display_name: String,
    pub allowed_roles: Vec<Role>,
    /// `None` means every allowed role may post
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub posting_roles: Option<Vec<Role>>,
    pub system_messages: bool,
}

impl Room {
    /// Room open to every role, without system messages
    pub fn open(key: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            display_name: display_name.into(),
            allowed_roles: Role::ALL.to_vec(),
            posting_roles: None,
            system_messages: false,
        }
    }

    pub fn with_allowed_roles(mut self, roles: &[Role]) -> Self {
        self.allowed_roles = roles.to_vec();
        self
    }

    pub fn with_posting_roles(mut self, roles: &[Role]) -> Self {
        self.posting_roles = Some(roles.to_vec());
        self
    }

    pub fn with_system_messages(mut self) -> Self {
        self.system_messages = true;
        self
    }

    pub fn can_join(&self, role: Role) -> bool {
        self.allowed_roles.contains(&role)
    }

    pub fn can_post(&self, role: Role) -> bool {
        match &self.posting_roles {
            Some(roles) => roles.contains(&role),
            None => true,
        }
    }

    /// Roles that may post, for error messages ("lecturer/admin")
    pub fn posting_roles_label(&self) -> String {
        let roles = self.posting_roles.as_deref().unwrap_or(&self.allowed_roles);
        roles
            .iter()
            .map(Role::as_str)
            .collect::<Vec<_>>()
            .join("/")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    File,
}

/// Resolved delivery target of a stored message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessageTarget {
    Direct {
        recipient_id: SessionId,
        recipient_name: String,
        /// Unknown when the recipient had no session at routing time
        #[serde(default, skip_serializing_if = "Option::is_none")]
        recipient_role: Option<Role>,
    },
    Room {
        room: RoomKey,
    },
    Broadcast,
}

/// File attachment. `payload` is always a `data:` URL once routed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub name: String,
    pub mime_type: String,
    pub size_bytes: u64,
    pub payload: String,
}

/// A routed chat message. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub message_id: String,
    pub kind: MessageKind,
    pub sender_id: SessionId,
    pub sender_name: String,
    pub sender_role: Role,
    pub target: MessageTarget,
    pub timestamp: u64,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileMeta>,
}

impl ChatMessage {
    pub fn room(&self) -> Option<&str> {
        match &self.target {
            MessageTarget::Room { room } => Some(room),
            _ => None,
        }
    }

    pub fn recipient_id(&self) -> Option<&str> {
        match &self.target {
            MessageTarget::Direct { recipient_id, .. } => Some(recipient_id),
            _ => None,
        }
    }

    pub fn recipient_name(&self) -> Option<&str> {
        match &self.target {
            MessageTarget::Direct { recipient_name, .. } => Some(recipient_name),
            _ => None,
        }
    }

    pub fn recipient_role(&self) -> Option<Role> {
        match &self.target {
            MessageTarget::Direct { recipient_role, .. } => *recipient_role,
            _ => None,
        }
    }

    /// Sent under `identity`, matched on name and role
    pub fn sent_by(&self, identity: &Identity) -> bool {
        self.sender_name == identity.name && self.sender_role == identity.role
    }

    /// Direct message addressed to `identity`. A target without a recorded
    /// role matches on name alone.
    pub fn addressed_to(&self, identity: &Identity) -> bool {
        match &self.target {
            MessageTarget::Direct {
                recipient_name,
                recipient_role,
                ..
            } => {
                *recipient_name == identity.name
                    && recipient_role.is_none_or(|role| role == identity.role)
            }
            _ => false,
        }
    }

    pub fn is_direct(&self) -> bool {
        matches!(self.target, MessageTarget::Direct { .. })
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(self.target, MessageTarget::Broadcast)
    }

    pub fn is_file(&self) -> bool {
        self.kind == MessageKind::File
    }
}

/// What a participant is currently looking at
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ViewContext {
    Room { room: RoomKey },
    Direct { peer_id: SessionId, peer_name: String },
}

impl ViewContext {
    pub fn room(key: impl Into<String>) -> Self {
        ViewContext::Room { room: key.into() }
    }

    pub fn direct(peer_id: impl Into<String>, peer_name: impl Into<String>) -> Self {
        ViewContext::Direct {
            peer_id: peer_id.into(),
            peer_name: peer_name.into(),
        }
    }

    /// Unread-counter key of this view
    pub fn conversation(&self) -> ConversationKey {
        match self {
            ViewContext::Room { room } => ConversationKey::Room(room.clone()),
            ViewContext::Direct { peer_id, .. } => ConversationKey::Peer(peer_id.clone()),
        }
    }
}

/// Key of an unread counter
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConversationKey {
    Room(RoomKey),
    Peer(SessionId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NotificationKind {
    NewMessage,
    NewRoomMessage,
    NewFile,
    NewRoomFile,
}

/// Ephemeral alert for a participant not viewing the conversation.
/// Never persisted and never carries file bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub kind: NotificationKind,
    pub from: String,
    pub from_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<RoomKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_session: Option<SessionId>,
    pub message_id: String,
    pub timestamp: u64,
}

/// Entry of the live user list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: SessionId,
    pub name: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<RoomKey>,
    pub active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parsing() {
        assert_eq!("Lecturer".parse::<Role>().unwrap(), Role::Lecturer);
        assert!("guest".parse::<Role>().is_err());
        assert_eq!(serde_json::to_string(&Role::Admin).unwrap(), "\"admin\"");
    }

    #[test]
    fn test_room_permissions() {
        let room = Room::open("announcements", "Announcements")
            .with_posting_roles(&[Role::Lecturer, Role::Admin]);
        assert!(room.can_join(Role::Student));
        assert!(!room.can_post(Role::Student));
        assert!(room.can_post(Role::Admin));
        assert_eq!(room.posting_roles_label(), "lecturer/admin");
    }

    #[test]
    fn test_target_serialization() {
        let target = MessageTarget::Room {
            room: "general".to_string(),
        };
        let json = serde_json::to_value(&target).unwrap();
        assert_eq!(json["type"], "room");
        assert_eq!(json["room"], "general");

        let broadcast: MessageTarget = serde_json::from_str(r#"{"type":"broadcast"}"#).unwrap();
        assert_eq!(broadcast, MessageTarget::Broadcast);
    }

    #[test]
    fn test_direct_target_matches_name_and_role() {
        let message = ChatMessage {
            message_id: "m1".to_string(),
            kind: MessageKind::Text,
            sender_id: "s-admin".to_string(),
            sender_name: "alice".to_string(),
            sender_role: Role::Admin,
            target: MessageTarget::Direct {
                recipient_id: "s-bob".to_string(),
                recipient_name: "bob".to_string(),
                recipient_role: Some(Role::Lecturer),
            },
            timestamp: 1,
            text: "hi".to_string(),
            file: None,
        };
        assert!(message.sent_by(&Identity::new("alice", Role::Admin)));
        assert!(!message.sent_by(&Identity::new("alice", Role::Student)));
        assert!(message.addressed_to(&Identity::new("bob", Role::Lecturer)));
        assert!(!message.addressed_to(&Identity::new("bob", Role::Student)));

        let legacy: MessageTarget = serde_json::from_str(
            r#"{"type":"direct","recipient_id":"s-bob","recipient_name":"bob"}"#,
        )
        .unwrap();
        let message = ChatMessage {
            target: legacy,
            ..message
        };
        assert!(message.addressed_to(&Identity::new("bob", Role::Student)));
    }

    #[test]
    fn test_view_conversation_key() {
        assert_eq!(
            ViewContext::room("general").conversation(),
            ConversationKey::Room("general".to_string())
        );
        assert_eq!(
            ViewContext::direct("s-1", "bob").conversation(),
            ConversationKey::Peer("s-1".to_string())
        );
    }
}
