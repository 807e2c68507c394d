use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{MessageLog, MessageQuery, MessageStore};
use crate::error::Result;
use crate::model::ChatMessage;

/// Volatile store; the default when no `--store` path is given
#[derive(Debug, Default)]
pub struct MemoryStore {
    log: RwLock<MessageLog>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.log.read().await.len()
    }

    pub async fn contains(&self, message_id: &str) -> bool {
        self.log.read().await.contains(message_id)
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn save(&self, message: &ChatMessage) -> Result<()> {
        self.log.write().await.insert(message.clone())
    }

    async fn find(&self, query: &MessageQuery) -> Result<Vec<ChatMessage>> {
        Ok(self.log.read().await.find(query))
    }

    async fn recent_files(&self, limit: usize) -> Result<Vec<ChatMessage>> {
        Ok(self.log.read().await.recent_files(limit))
    }

    async fn health(&self) -> Result<()> {
        Ok(())
    }
}
