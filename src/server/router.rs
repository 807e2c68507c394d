//! Message router: validates a send request, assigns the id, hands the
//! message to the store and computes who receives what.
//!
//! The router holds no per-call state; the hub passes it the registry and
//! directory it owns.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tracing::{debug, error};

use crate::error::{ChatError, Result};
use crate::model::{
    ChatMessage, FileMeta, MessageKind, MessageTarget, Notification, RoomKey, SessionId,
};
use crate::notify;
use crate::protocol::messages::{SendMessage, ShareFile, TargetFields};
use crate::server::rooms::RoomDirectory;
use crate::server::sessions::SessionRegistry;
use crate::store::MessageStore;
use crate::{current_timestamp, generate_message_id};

/// Fallback MIME type for files sent without one
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Target shape after resolving the wire fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Direct {
        recipient_id: SessionId,
        recipient_name: Option<String>,
    },
    Room(RoomKey),
    Broadcast,
}

impl TargetFields {
    /// A recipient id wins over a room key; neither means broadcast
    pub fn resolve(self) -> Target {
        match (self.recipient_id, self.room) {
            (Some(recipient_id), _) if !recipient_id.is_empty() => Target::Direct {
                recipient_id,
                recipient_name: self.recipient_name,
            },
            (_, Some(room)) if !room.is_empty() => Target::Room(room),
            _ => Target::Broadcast,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text {
        text: String,
    },
    File {
        name: String,
        mime_type: Option<String>,
        size_bytes: u64,
        payload: String,
    },
}

/// Validated send request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub target: Target,
    pub payload: Payload,
    pub message_id: Option<String>,
}

impl From<SendMessage> for Outgoing {
    fn from(msg: SendMessage) -> Self {
        Self {
            target: msg.target.resolve(),
            payload: Payload::Text { text: msg.text },
            message_id: msg.message_id,
        }
    }
}

impl From<ShareFile> for Outgoing {
    fn from(msg: ShareFile) -> Self {
        Self {
            target: msg.target.resolve(),
            payload: Payload::File {
                name: msg.name,
                mime_type: msg.mime_type,
                size_bytes: msg.size_bytes,
                payload: msg.payload,
            },
            message_id: msg.message_id,
        }
    }
}

/// One copy of a message for one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub session_id: SessionId,
    /// Sender's echo of a direct message
    pub confirmation: bool,
}

#[derive(Debug, Clone)]
pub struct RoutePlan {
    pub message: ChatMessage,
    pub deliveries: Vec<Delivery>,
    pub notifications: Vec<(SessionId, Notification)>,
}

pub struct MessageRouter {
    store: Arc<dyn MessageStore>,
    preview_chars: usize,
}

impl MessageRouter {
    pub fn new(store: Arc<dyn MessageStore>, preview_chars: usize) -> Self {
        Self {
            store,
            preview_chars,
        }
    }

    /// Route a message from `sender_id`.
    ///
    /// Fails without side effects on an unknown room or a role that may not
    /// post there. On success the message has been handed to the store and
    /// the returned plan lists every delivery and notification.
    pub fn route(
        &self,
        rooms: &RoomDirectory,
        sessions: &SessionRegistry,
        sender_id: &str,
        outgoing: Outgoing,
    ) -> Result<RoutePlan> {
        let sender = sessions
            .find(sender_id)
            .ok_or_else(|| ChatError::not_joined(sender_id.to_string()))?;

        let target = match outgoing.target {
            Target::Direct {
                recipient_id,
                recipient_name,
            } => {
                let recipient = sessions.find(&recipient_id);
                let recipient_name = recipient_name
                    .filter(|n| !n.is_empty())
                    .or_else(|| recipient.map(|s| s.name().to_string()))
                    .unwrap_or_else(|| recipient_id.clone());
                MessageTarget::Direct {
                    recipient_role: recipient.map(|s| s.role()),
                    recipient_id,
                    recipient_name,
                }
            }
            Target::Room(key) => {
                rooms.check_post(&key, sender.role())?;
                MessageTarget::Room { room: key }
            }
            Target::Broadcast => MessageTarget::Broadcast,
        };

        let (kind, text, file) = match outgoing.payload {
            Payload::Text { text } => {
                if text.trim().is_empty() {
                    return Err(ChatError::invalid_message("Message text is empty"));
                }
                (MessageKind::Text, text, None)
            }
            Payload::File {
                name,
                mime_type,
                size_bytes,
                payload,
            } => {
                if name.is_empty() || payload.is_empty() {
                    return Err(ChatError::invalid_message("File name and payload are required"));
                }
                let mime_type = mime_type
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string());
                let payload = normalize_payload(payload, &mime_type);
                let size_bytes = if size_bytes > 0 {
                    size_bytes
                } else {
                    decoded_size(&payload)
                };
                let text = format!("Shared file: {}", name);
                let file = FileMeta {
                    name,
                    mime_type,
                    size_bytes,
                    payload,
                };
                (MessageKind::File, text, Some(file))
            }
        };

        let message = ChatMessage {
            message_id: outgoing
                .message_id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(generate_message_id),
            kind,
            sender_id: sender.id.clone(),
            sender_name: sender.name().to_string(),
            sender_role: sender.role(),
            target,
            timestamp: current_timestamp(),
            text,
            file,
        };

        self.persist(&message);
        let (deliveries, notifications) = self.fan_out(sessions, &message);

        debug!(
            "Routed {} from {} to {} connection(s), {} notification(s)",
            message.message_id,
            message.sender_name,
            deliveries.len(),
            notifications.len()
        );

        Ok(RoutePlan {
            message,
            deliveries,
            notifications,
        })
    }

    /// Hand the message to the store without waiting for it
    fn persist(&self, message: &ChatMessage) {
        let store = Arc::clone(&self.store);
        let message = message.clone();
        tokio::spawn(async move {
            if let Err(e) = store.save(&message).await {
                error!("Failed to persist message {}: {}", message.message_id, e);
            }
        });
    }

    fn fan_out(
        &self,
        sessions: &SessionRegistry,
        message: &ChatMessage,
    ) -> (Vec<Delivery>, Vec<(SessionId, Notification)>) {
        let mut deliveries = Vec::new();
        let mut notifications = Vec::new();
        let sender_id = message.sender_id.as_str();

        match &message.target {
            MessageTarget::Direct { recipient_id, .. } => {
                if recipient_id != sender_id {
                    if let Some(recipient) = sessions.find(recipient_id).filter(|s| s.is_active())
                    {
                        deliveries.push(Delivery {
                            session_id: recipient.id.clone(),
                            confirmation: false,
                        });
                        if let Some(n) =
                            notify::derive(message, recipient.view.as_ref(), self.preview_chars)
                        {
                            notifications.push((recipient.id.clone(), n));
                        }
                    }
                }
                deliveries.push(Delivery {
                    session_id: sender_id.to_string(),
                    confirmation: true,
                });
            }
            MessageTarget::Room { room } => {
                let mut sender_included = false;
                for member in sessions.members_of(room) {
                    deliveries.push(Delivery {
                        session_id: member.id.clone(),
                        confirmation: false,
                    });
                    if member.id == sender_id {
                        sender_included = true;
                    } else if let Some(n) =
                        notify::derive(message, member.view.as_ref(), self.preview_chars)
                    {
                        notifications.push((member.id.clone(), n));
                    }
                }
                if !sender_included {
                    deliveries.push(Delivery {
                        session_id: sender_id.to_string(),
                        confirmation: false,
                    });
                }
            }
            MessageTarget::Broadcast => {
                deliveries.extend(sessions.live().map(|s| Delivery {
                    session_id: s.id.clone(),
                    confirmation: false,
                }));
            }
        }

        (deliveries, notifications)
    }
}

/// Turn bare base64 into a `data:` URL; complete URLs pass through
pub fn normalize_payload(payload: String, mime_type: &str) -> String {
    if payload.starts_with("data:") {
        payload
    } else {
        format!("data:{};base64,{}", mime_type, payload)
    }
}

fn decoded_size(data_url: &str) -> u64 {
    data_url
        .split_once(";base64,")
        .and_then(|(_, data)| BASE64.decode(data).ok())
        .map(|bytes| bytes.len() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Identity, Role, ViewContext};
    use crate::store::{MemoryStore, MessageQuery, QueryScope};
    use tokio::time::Instant;

    struct Fixture {
        rooms: RoomDirectory,
        sessions: SessionRegistry,
        store: Arc<MemoryStore>,
        router: MessageRouter,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let mut sessions = SessionRegistry::new();
        let now = Instant::now();
        for (id, name, role, room) in [
            ("alice", "alice", Role::Student, "general"),
            ("bob", "bob", Role::Student, "general"),
            ("carol", "carol", Role::Lecturer, "assignments"),
        ] {
            sessions.join(id.into(), Identity::new(name, role), now);
            sessions.switch_room(id, room);
            sessions.set_view(id, ViewContext::room(room));
        }
        Fixture {
            rooms: RoomDirectory::default(),
            sessions,
            router: MessageRouter::new(store.clone(), notify::PREVIEW_CHARS),
            store,
        }
    }

    fn text_to(target: TargetFields, text: &str) -> Outgoing {
        SendMessage {
            text: text.to_string(),
            target,
            message_id: None,
        }
        .into()
    }

    /// Let spawned persistence tasks run
    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    fn recipients(plan: &RoutePlan) -> Vec<&str> {
        let mut ids: Vec<&str> = plan
            .deliveries
            .iter()
            .map(|d| d.session_id.as_str())
            .collect();
        ids.sort();
        ids
    }

    #[test]
    fn test_resolve_precedence() {
        let both = TargetFields {
            recipient_id: Some("bob".into()),
            recipient_name: None,
            room: Some("general".into()),
        };
        assert!(matches!(both.resolve(), Target::Direct { .. }));
        assert_eq!(
            TargetFields::room("general").resolve(),
            Target::Room("general".into())
        );
        assert_eq!(TargetFields::broadcast().resolve(), Target::Broadcast);

        let empty_recipient = TargetFields {
            recipient_id: Some(String::new()),
            recipient_name: None,
            room: Some("assignments".into()),
        };
        assert_eq!(
            empty_recipient.resolve(),
            Target::Room("assignments".into())
        );
    }

    #[tokio::test]
    async fn test_room_fanout_and_notifications() {
        let f = fixture();
        let plan = f
            .router
            .route(
                &f.rooms,
                &f.sessions,
                "alice",
                text_to(TargetFields::room("general"), "hi"),
            )
            .unwrap();

        assert_eq!(recipients(&plan), vec!["alice", "bob"]);
        // bob is looking at general, so nobody is notified
        assert!(plan.notifications.is_empty());
        assert_eq!(plan.message.room(), Some("general"));
    }

    #[tokio::test]
    async fn test_sender_echoed_when_not_member() {
        let f = fixture();
        let plan = f
            .router
            .route(
                &f.rooms,
                &f.sessions,
                "alice",
                text_to(TargetFields::room("assignments"), "question"),
            )
            .unwrap();

        assert_eq!(recipients(&plan), vec!["alice", "carol"]);
        assert!(plan.notifications.is_empty());
    }

    #[tokio::test]
    async fn test_room_member_viewing_elsewhere_is_notified() {
        let mut f = fixture();
        f.sessions
            .set_view("bob", ViewContext::direct("carol", "carol"));
        let plan = f
            .router
            .route(
                &f.rooms,
                &f.sessions,
                "alice",
                text_to(TargetFields::room("general"), "ping"),
            )
            .unwrap();

        assert_eq!(plan.notifications.len(), 1);
        assert_eq!(plan.notifications[0].0, "bob");
    }

    #[tokio::test]
    async fn test_permission_denied_has_no_effects() {
        let f = fixture();
        let err = f
            .router
            .route(
                &f.rooms,
                &f.sessions,
                "alice",
                text_to(TargetFields::room("announcements"), "hello"),
            )
            .unwrap_err();

        assert_eq!(err.code(), 1008);
        settle().await;
        assert_eq!(f.store.len().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_room() {
        let f = fixture();
        let err = f
            .router
            .route(
                &f.rooms,
                &f.sessions,
                "alice",
                text_to(TargetFields::room("lounge"), "hello"),
            )
            .unwrap_err();
        assert_eq!(err, ChatError::room_not_found("lounge"));
    }

    #[tokio::test]
    async fn test_direct_isolation_and_confirmation() {
        let f = fixture();
        let plan = f
            .router
            .route(
                &f.rooms,
                &f.sessions,
                "alice",
                text_to(TargetFields::direct("bob", "bob"), "secret"),
            )
            .unwrap();

        assert_eq!(recipients(&plan), vec!["alice", "bob"]);
        let echo = plan
            .deliveries
            .iter()
            .find(|d| d.session_id == "alice")
            .unwrap();
        assert!(echo.confirmation);
        assert_eq!(plan.notifications.len(), 1);
        assert_eq!(plan.notifications[0].0, "bob");
        assert_eq!(plan.message.recipient_name(), Some("bob"));
    }

    #[tokio::test]
    async fn test_direct_to_offline_recipient_is_stored() {
        let mut f = fixture();
        f.sessions.mark_inactive("bob", Instant::now());
        let plan = f
            .router
            .route(
                &f.rooms,
                &f.sessions,
                "alice",
                text_to(
                    TargetFields {
                        recipient_id: Some("bob".into()),
                        recipient_name: None,
                        room: None,
                    },
                    "later",
                ),
            )
            .unwrap();

        assert_eq!(recipients(&plan), vec!["alice"]);
        assert_eq!(plan.message.recipient_name(), Some("bob"));

        settle().await;
        let stored = f
            .store
            .find(&MessageQuery::new(QueryScope::RelevantTo(Identity::new(
                "bob",
                Role::Student,
            ))))
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_live_session() {
        let f = fixture();
        let plan = f
            .router
            .route(
                &f.rooms,
                &f.sessions,
                "carol",
                text_to(TargetFields::broadcast(), "all hands"),
            )
            .unwrap();

        assert_eq!(recipients(&plan), vec!["alice", "bob", "carol"]);
        assert!(plan.notifications.is_empty());
    }

    #[tokio::test]
    async fn test_file_normalization() {
        let f = fixture();
        let outgoing: Outgoing = ShareFile {
            name: "hello.txt".to_string(),
            mime_type: None,
            size_bytes: 0,
            payload: "aGVsbG8=".to_string(),
            target: TargetFields::room("general"),
            message_id: Some("client-id-1".to_string()),
        }
        .into();

        let plan = f
            .router
            .route(&f.rooms, &f.sessions, "bob", outgoing)
            .unwrap();
        let file = plan.message.file.as_ref().unwrap();

        assert_eq!(plan.message.message_id, "client-id-1");
        assert_eq!(plan.message.text, "Shared file: hello.txt");
        assert_eq!(file.mime_type, DEFAULT_MIME_TYPE);
        assert_eq!(file.payload, "data:application/octet-stream;base64,aGVsbG8=");
        assert_eq!(file.size_bytes, 5);
    }

    #[test]
    fn test_data_url_passes_through() {
        let url = "data:image/png;base64,AAAA".to_string();
        assert_eq!(normalize_payload(url.clone(), "text/plain"), url);
    }

    #[tokio::test]
    async fn test_empty_text_rejected() {
        let f = fixture();
        let err = f
            .router
            .route(
                &f.rooms,
                &f.sessions,
                "alice",
                text_to(TargetFields::broadcast(), "   "),
            )
            .unwrap_err();
        assert!(matches!(err, ChatError::InvalidMessage(_)));
    }

    #[tokio::test]
    async fn test_unknown_sender() {
        let f = fixture();
        let err = f
            .router
            .route(
                &f.rooms,
                &f.sessions,
                "nobody",
                text_to(TargetFields::broadcast(), "hi"),
            )
            .unwrap_err();
        assert!(matches!(err, ChatError::NotJoined(_)));
    }
}
