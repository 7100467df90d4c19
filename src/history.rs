//! Persisted conversation history, keyed by session.
//!
//! The engine only ever swaps whole turn lists in and out, so the store deals in
//! full snapshots rather than individual turns.

use crate::types::{Conversation, Result, SessionId, Turn};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Turns saved for `session`, empty when nothing was saved yet.
    async fn load(&self, session: &SessionId) -> Result<Vec<Turn>>;
    async fn save(&self, session: &SessionId, conversation: &Conversation) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryHistory {
    sessions: RwLock<HashMap<SessionId, Vec<Turn>>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistory {
    async fn load(&self, session: &SessionId) -> Result<Vec<Turn>> {
        Ok(self
            .sessions
            .read()
            .await
            .get(session)
            .cloned()
            .unwrap_or_default())
    }

    async fn save(&self, session: &SessionId, conversation: &Conversation) -> Result<()> {
        self.sessions
            .write()
            .await
            .insert(session.clone(), conversation.turns.clone());
        Ok(())
    }
}

/// One pretty-printed `conversation.json` per session directory.
#[derive(Debug, Clone)]
pub struct FileHistory {
    base_path: PathBuf,
}

impl FileHistory {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            base_path: path.as_ref().to_path_buf(),
        }
    }

    fn conversation_path(&self, session: &SessionId) -> PathBuf {
        let dir: String = session
            .0
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.base_path.join(dir).join("conversation.json")
    }
}

#[async_trait]
impl HistoryStore for FileHistory {
    async fn load(&self, session: &SessionId) -> Result<Vec<Turn>> {
        let path = self.conversation_path(session);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = tokio::fs::read_to_string(&path).await?;
        let conversation: Conversation = serde_json::from_str(&content)?;
        tracing::debug!(
            "[KERNEL] Loaded {} turns for session {}",
            conversation.turns.len(),
            session.short()
        );
        Ok(conversation.turns)
    }

    async fn save(&self, session: &SessionId, conversation: &Conversation) -> Result<()> {
        let path = self.conversation_path(session);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let content = serde_json::to_string_pretty(conversation)?;
        tokio::fs::write(&path, content).await?;
        Ok(())
    }
}
