use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{MessageLog, MessageQuery, MessageStore};
use crate::error::{ChatError, Result};
use crate::model::ChatMessage;

struct JsonlState {
    log: MessageLog,
    file: File,
}

/// Append-only JSON-lines file, one message per line, replayed on open
pub struct JsonlStore {
    path: PathBuf,
    state: Mutex<JsonlState>,
}

impl JsonlStore {
    /// Open (or create) the store at `path` and load its messages
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut log = MessageLog::default();

        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                for (line_no, line) in contents.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<ChatMessage>(line) {
                        Ok(message) => {
                            if let Err(e) = log.insert(message) {
                                warn!("{}:{}: {}", path.display(), line_no + 1, e);
                            }
                        }
                        Err(e) => warn!(
                            "{}:{}: skipping malformed line: {}",
                            path.display(),
                            line_no + 1,
                            e
                        ),
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(ChatError::persistence(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    e
                )));
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| {
                ChatError::persistence(format!("Failed to open {}: {}", path.display(), e))
            })?;

        info!("Loaded {} messages from {}", log.len(), path.display());

        Ok(Self {
            path,
            state: Mutex::new(JsonlState { log, file }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl MessageStore for JsonlStore {
    async fn save(&self, message: &ChatMessage) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.log.contains(&message.message_id) {
            return Err(ChatError::persistence(format!(
                "Duplicate message id {}",
                message.message_id
            )));
        }

        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');
        state
            .file
            .write_all(&line)
            .await
            .map_err(|e| ChatError::persistence(format!("Append failed: {}", e)))?;
        state
            .file
            .flush()
            .await
            .map_err(|e| ChatError::persistence(format!("Flush failed: {}", e)))?;

        state.log.insert(message.clone())
    }

    async fn find(&self, query: &MessageQuery) -> Result<Vec<ChatMessage>> {
        Ok(self.state.lock().await.log.find(query))
    }

    async fn recent_files(&self, limit: usize) -> Result<Vec<ChatMessage>> {
        Ok(self.state.lock().await.log.recent_files(limit))
    }

    async fn health(&self) -> Result<()> {
        tokio::fs::metadata(&self.path)
            .await
            .map(|_| ())
            .map_err(|e| ChatError::persistence(format!("{}: {}", self.path.display(), e)))
    }
}
