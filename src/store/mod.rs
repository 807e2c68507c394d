//! Message persistence collaborator
//!
//! The coordinator only needs `save` and `find`; everything else here serves
//! the query frames. Two implementations: [`MemoryStore`] and the append-only
//! [`JsonlStore`].

mod jsonl;
mod memory;

pub use jsonl::JsonlStore;
pub use memory::MemoryStore;

use std::collections::HashSet;

use async_trait::async_trait;

use crate::error::{ChatError, Result};
use crate::model::{ChatMessage, Identity, MessageTarget, RoomKey};

/// Default number of messages returned by a query
pub const DEFAULT_QUERY_LIMIT: usize = 50;

/// Durable message store
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a message. Duplicate ids are rejected.
    async fn save(&self, message: &ChatMessage) -> Result<()>;

    /// Most recent `limit` matches, oldest first
    async fn find(&self, query: &MessageQuery) -> Result<Vec<ChatMessage>>;

    /// Newest file messages first
    async fn recent_files(&self, limit: usize) -> Result<Vec<ChatMessage>>;

    async fn health(&self) -> Result<()>;
}

/// Which messages a query selects
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryScope {
    /// Messages posted to a room
    Room(RoomKey),
    /// Direct messages between two names, either direction
    Conversation(String, String),
    /// Room and broadcast messages plus direct messages sent or received by
    /// an identity
    RelevantTo(Identity),
    All,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageQuery {
    pub scope: QueryScope,
    pub files_only: bool,
    pub limit: usize,
}

impl MessageQuery {
    pub fn new(scope: QueryScope) -> Self {
        Self {
            scope,
            files_only: false,
            limit: DEFAULT_QUERY_LIMIT,
        }
    }

    pub fn files_only(mut self) -> Self {
        self.files_only = true;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn matches(&self, message: &ChatMessage) -> bool {
        if self.files_only && !message.is_file() {
            return false;
        }

        match (&self.scope, &message.target) {
            (QueryScope::All, _) => true,
            (QueryScope::Room(key), MessageTarget::Room { room }) => key == room,
            (QueryScope::Room(_), _) => false,
            (QueryScope::Conversation(a, b), MessageTarget::Direct { recipient_name, .. }) => {
                (message.sender_name == *a && recipient_name == b)
                    || (message.sender_name == *b && recipient_name == a)
            }
            (QueryScope::Conversation(..), _) => false,
            (QueryScope::RelevantTo(_), MessageTarget::Room { .. } | MessageTarget::Broadcast) => {
                true
            }
            (QueryScope::RelevantTo(identity), MessageTarget::Direct { .. }) => {
                message.sent_by(identity) || message.addressed_to(identity)
            }
        }
    }
}

/// In-memory message log shared by the store implementations
#[derive(Debug, Default)]
pub(crate) struct MessageLog {
    messages: Vec<ChatMessage>,
    ids: HashSet<String>,
}

impl MessageLog {
    pub(crate) fn insert(&mut self, message: ChatMessage) -> Result<()> {
        if !self.ids.insert(message.message_id.clone()) {
            return Err(ChatError::persistence(format!(
                "Duplicate message id {}",
                message.message_id
            )));
        }
        self.messages.push(message);
        Ok(())
    }

    pub(crate) fn contains(&self, message_id: &str) -> bool {
        self.ids.contains(message_id)
    }

    pub(crate) fn find(&self, query: &MessageQuery) -> Vec<ChatMessage> {
        let mut matched: Vec<&ChatMessage> =
            self.messages.iter().filter(|m| query.matches(m)).collect();
        // Stable: equal timestamps keep arrival order
        matched.sort_by_key(|m| m.timestamp);
        let skip = matched.len().saturating_sub(query.limit);
        matched.into_iter().skip(skip).cloned().collect()
    }

    pub(crate) fn recent_files(&self, limit: usize) -> Vec<ChatMessage> {
        let mut files = self.find(&MessageQuery::new(QueryScope::All).files_only().limit(limit));
        files.reverse();
        files
    }

    pub(crate) fn len(&self) -> usize {
        self.messages.len()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::model::{ChatMessage, FileMeta, MessageKind, MessageTarget, Role};

    pub fn text(id: &str, sender: &str, target: MessageTarget, timestamp: u64) -> ChatMessage {
        ChatMessage {
            message_id: id.to_string(),
            kind: MessageKind::Text,
            sender_id: format!("{}-conn", sender),
            sender_name: sender.to_string(),
            sender_role: Role::Student,
            target,
            timestamp,
            text: format!("message {}", id),
            file: None,
        }
    }

    pub fn file(id: &str, sender: &str, target: MessageTarget, timestamp: u64) -> ChatMessage {
        let mut message = text(id, sender, target, timestamp);
        message.kind = MessageKind::File;
        message.text = format!("Shared file: {}.txt", id);
        message.file = Some(FileMeta {
            name: format!("{}.txt", id),
            mime_type: "text/plain".to_string(),
            size_bytes: 2,
            payload: "data:text/plain;base64,aGk=".to_string(),
        });
        message
    }

    pub fn room(key: &str) -> MessageTarget {
        MessageTarget::Room {
            room: key.to_string(),
        }
    }

    pub fn direct(to: &str) -> MessageTarget {
        MessageTarget::Direct {
            recipient_id: format!("{}-conn", to),
            recipient_name: to.to_string(),
            recipient_role: None,
        }
    }
}
