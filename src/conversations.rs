//! Conversation index: keyed get/put/delete of [`Conversation`] rows.
//!
//! The service only needs the trait; [`JsonConversationStore`] keeps every
//! row in one `conversations.json`, rewritten atomically on each change.

use crate::error::{Error, Result};
use crate::message::Conversation;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::warn;

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Conversation>>;

    /// Insert or replace by id.
    async fn put(&self, conversation: &Conversation) -> Result<()>;

    /// Returns whether a row was removed.
    async fn delete(&self, id: &str) -> Result<bool>;

    /// All rows, optionally for one worker, most recently active first.
    async fn list(&self, worker: Option<&str>) -> Result<Vec<Conversation>>;
}

#[derive(Debug)]
pub struct JsonConversationStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonConversationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// `<data_dir>/conversations.json`
    pub fn in_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join("conversations.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<Vec<Conversation>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(Vec::new()),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                warn!(path = %self.path.display(), error = %e, "conversation index unreadable");
                Error::Json(e)
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, rows: Vec<Conversation>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(&rows)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || crate::store::atomic_write(&path, &json))
            .await
            .map_err(std::io::Error::other)??;
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for JsonConversationStore {
    async fn get(&self, id: &str) -> Result<Option<Conversation>> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.into_iter().find(|c| c.id == id))
    }

    async fn put(&self, conversation: &Conversation) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut rows = self.load().await?;
        match rows.iter_mut().find(|c| c.id == conversation.id) {
            Some(row) => *row = conversation.clone(),
            None => rows.push(conversation.clone()),
        }
        self.save(rows).await
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let mut rows = self.load().await?;
        let before = rows.len();
        rows.retain(|c| c.id != id);
        if rows.len() == before {
            return Ok(false);
        }
        self.save(rows).await?;
        Ok(true)
    }

    async fn list(&self, worker: Option<&str>) -> Result<Vec<Conversation>> {
        let _guard = self.lock.lock().await;
        let mut rows: Vec<Conversation> = self
            .load()
            .await?
            .into_iter()
            .filter(|c| worker.is_none_or(|w| c.worker_name == w))
            .collect();
        rows.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        Ok(rows)
    }
}
