//! Conversation lifecycle: create, message, sync, query and delete
//! conversations across workers.

use crate::agents::claude_code::ClaudeCodeDriver;
use crate::agents::opencode::OpenCodeDriver;
use crate::agents::{DriverRegistry, SessionDriver, SessionReply};
use crate::config::Config;
use crate::conversations::{ConversationStore, JsonConversationStore};
use crate::error::{Error, Result};
use crate::message::{Conversation, InputRecord, InputRole, NormalizedMessage, Worker};
use crate::registry::SessionRegistry;
use crate::store::RecordStore;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Result of [`ConversationService::send_message`].
#[derive(Debug, Clone, Serialize)]
pub struct SendOutcome {
    pub conversation: Conversation,
    pub reply: SessionReply,
}

/// Result of [`ConversationService::sync`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncOutcome {
    /// Messages whose uuid was not stored before this sync.
    pub synced: usize,
    /// Messages stored after this sync.
    pub total: usize,
}

pub struct ConversationService {
    workers: HashMap<String, Worker>,
    drivers: DriverRegistry,
    conversations: Arc<dyn ConversationStore>,
    records: Arc<RecordStore>,
    registry: Arc<SessionRegistry>,
    // Serializes read-modify-write sequences on the conversation index.
    index: Mutex<()>,
}

impl std::fmt::Debug for ConversationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationService")
            .field("workers", &self.workers.keys().collect::<Vec<_>>())
            .field("drivers", &self.drivers)
            .field("records", &self.records.root())
            .finish()
    }
}

impl ConversationService {
    pub fn new(
        workers: Vec<Worker>,
        drivers: DriverRegistry,
        conversations: Arc<dyn ConversationStore>,
        records: Arc<RecordStore>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            workers: workers.into_iter().map(|w| (w.name.clone(), w)).collect(),
            drivers,
            conversations,
            records,
            registry,
            index: Mutex::new(()),
        }
    }

    /// Wire up the stock stores and drivers from `config`.
    pub fn from_config(config: &Config) -> Self {
        let records = Arc::new(
            RecordStore::new(config.data_dir.join("records")).with_block_size(config.read_block_size),
        );
        let registry = Arc::new(SessionRegistry::new());

        let mut drivers = DriverRegistry::new();
        drivers.register(Arc::new(ClaudeCodeDriver::from_config(
            config,
            Arc::clone(&records),
            Arc::clone(&registry),
        )));
        drivers.register(Arc::new(OpenCodeDriver));

        Self::new(
            config.workers(),
            drivers,
            Arc::new(JsonConversationStore::in_dir(&config.data_dir)),
            records,
            registry,
        )
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn records(&self) -> &Arc<RecordStore> {
        &self.records
    }

    pub fn worker(&self, name: &str) -> Result<&Worker> {
        self.workers
            .get(name)
            .ok_or_else(|| Error::not_found(format!("worker {name}")))
    }

    fn driver(&self, worker: &Worker) -> Result<Arc<dyn SessionDriver>> {
        self.drivers.get(worker.kind)
    }

    // -----------------------------------------------------------------------
    // Conversation index
    // -----------------------------------------------------------------------

    /// New, unstarted conversation; it becomes the worker's current one.
    pub async fn create(
        &self,
        worker: &str,
        project_path: &Path,
        name: Option<String>,
    ) -> Result<Conversation> {
        self.worker(worker)?;
        let project_path = tokio::fs::canonicalize(project_path)
            .await
            .map_err(|e| Error::from_io_at(e, project_path))?;
        if !tokio::fs::metadata(&project_path).await?.is_dir() {
            return Err(Error::invalid_state(format!(
                "{} is not a directory",
                project_path.display()
            )));
        }

        let _index = self.index.lock().await;
        let mut conversation = Conversation::new(worker, project_path, name);
        self.clear_current(worker, &conversation.id).await?;
        conversation.is_current = true;
        self.conversations.put(&conversation).await?;
        info!(conversation_id = %conversation.id, worker, "conversation created");
        Ok(conversation)
    }

    pub async fn get(&self, id: &str) -> Result<Conversation> {
        self.conversations
            .get(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("conversation {id}")))
    }

    pub async fn list(&self, worker: Option<&str>) -> Result<Vec<Conversation>> {
        self.conversations.list(worker).await
    }

    pub async fn rename(&self, id: &str, name: &str) -> Result<Conversation> {
        let _index = self.index.lock().await;
        let mut conversation = self.get(id).await?;
        conversation.name = name.to_string();
        self.conversations.put(&conversation).await?;
        Ok(conversation)
    }

    /// Make `id` its worker's current conversation.
    pub async fn switch(&self, id: &str) -> Result<Conversation> {
        let _index = self.index.lock().await;
        let mut conversation = self.get(id).await?;
        self.clear_current(&conversation.worker_name, id).await?;
        if !conversation.is_current {
            conversation.is_current = true;
            self.conversations.put(&conversation).await?;
        }
        Ok(conversation)
    }

    pub async fn current(&self, worker: &str) -> Result<Option<Conversation>> {
        Ok(self
            .conversations
            .list(Some(worker))
            .await?
            .into_iter()
            .find(|c| c.is_current))
    }

    async fn clear_current(&self, worker: &str, except: &str) -> Result<()> {
        for mut other in self.conversations.list(Some(worker)).await? {
            if other.is_current && other.id != except {
                other.is_current = false;
                self.conversations.put(&other).await?;
            }
        }
        Ok(())
    }

    /// Stop auto-syncing the conversation but keep it and its records.
    pub async fn archive(&self, id: &str) -> Result<Conversation> {
        let conversation = self.get(id).await?;
        let handle = conversation.require_handle()?;
        let worker = self.worker(&conversation.worker_name)?;
        self.driver(worker)?.archive(handle).await?;

        let _index = self.index.lock().await;
        let mut conversation = self.get(id).await?;
        conversation.archived = true;
        self.conversations.put(&conversation).await?;
        Ok(conversation)
    }

    /// Deactivate the session, delete the record files and drop the row.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let conversation = self.get(id).await?;
        if let Some(handle) = conversation.handle() {
            self.registry.deactivate(handle);
        }

        let lock = self.records.sync_lock(id);
        let _sync = lock.lock().await;
        let removed = self
            .records
            .delete_conversation(&conversation.worker_name, id)
            .await?;
        let _index = self.index.lock().await;
        self.conversations.delete(id).await?;
        info!(conversation_id = %id, records_removed = removed, "conversation deleted");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Messaging
    // -----------------------------------------------------------------------

    /// Record `text` as input, then start the agent session (first message)
    /// or resume it. A failed start leaves the conversation unstarted.
    pub async fn send_message(&self, id: &str, text: &str) -> Result<SendOutcome> {
        let conversation = self.get(id).await?;
        let worker = self.worker(&conversation.worker_name)?;
        let driver = self.driver(worker)?;

        self.records
            .append_input(
                &conversation.worker_name,
                id,
                &InputRecord::new(InputRole::User, text),
            )
            .await?;

        let reply = match conversation.handle() {
            None => driver.start(worker, &conversation, text).await?,
            Some(_) => driver.resume(worker, &conversation, text).await?,
        };

        let _index = self.index.lock().await;
        let mut latest = self.get(id).await?;
        match latest.handle() {
            None => latest.raw_conversation_id = Some(reply.handle.clone()),
            Some(existing) if existing != reply.handle => {
                debug!(conversation_id = %id, existing, reported = %reply.handle, "keeping stored handle");
            }
            Some(_) => {}
        }
        latest.archived = false;
        latest.touch();
        self.conversations.put(&latest).await?;

        Ok(SendOutcome {
            conversation: latest,
            reply,
        })
    }

    /// Re-read the agent's log and replace the stored messages. Serialized
    /// per conversation with the watch-driven sync.
    pub async fn sync(&self, id: &str) -> Result<SyncOutcome> {
        let conversation = self.get(id).await?;
        let worker = self.worker(&conversation.worker_name)?;
        let driver = self.driver(worker)?;

        let lock = self.records.sync_lock(id);
        let _guard = lock.lock().await;

        let messages = driver.sync_messages(&conversation).await?;
        let known: HashSet<String> = self
            .records
            .read_messages(&conversation.worker_name, id, None)
            .await?
            .into_iter()
            .map(|m| m.uuid)
            .collect();
        let synced = messages.iter().filter(|m| !known.contains(&m.uuid)).count();
        let total = self
            .records
            .overwrite_messages(&conversation.worker_name, id, &messages)
            .await?;

        debug!(conversation_id = %id, synced, total, "conversation synced");
        Ok(SyncOutcome { synced, total })
    }

    /// Most recent inputs, oldest first.
    pub async fn inputs(&self, id: &str, limit: Option<usize>) -> Result<Vec<InputRecord>> {
        let conversation = self.get(id).await?;
        self.records
            .read_inputs(&conversation.worker_name, id, limit)
            .await
    }

    pub async fn messages(&self, id: &str, limit: Option<usize>) -> Result<Vec<NormalizedMessage>> {
        let conversation = self.get(id).await?;
        self.records
            .read_messages(&conversation.worker_name, id, limit)
            .await
    }

    // -----------------------------------------------------------------------
    // Auto-sync lifecycle
    // -----------------------------------------------------------------------

    /// Re-activate every started, non-archived conversation. Returns how many
    /// were activated; conversations whose driver cannot watch are skipped.
    pub async fn activate_all(&self) -> Result<usize> {
        let mut activated = 0;
        for conversation in self.conversations.list(None).await? {
            if conversation.handle().is_none() || conversation.archived {
                continue;
            }
            let driver = match self
                .worker(&conversation.worker_name)
                .and_then(|w| self.driver(w))
            {
                Ok(driver) => driver,
                Err(e) => {
                    warn!(conversation_id = %conversation.id, error = %e, "skipping conversation");
                    continue;
                }
            };
            match driver.activate(&conversation).await {
                Ok(()) => activated += 1,
                Err(e) => warn!(conversation_id = %conversation.id, error = %e, "could not activate"),
            }
        }
        Ok(activated)
    }

    /// Deactivate everything and tear down all watches.
    pub fn shutdown(&self) {
        self.registry.stop_all();
    }
}
