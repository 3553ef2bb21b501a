//! Agent session drivers
//!
//! Each submodule drives one AI coding agent CLI. Drivers are picked at
//! runtime from a [`DriverRegistry`] keyed by the worker's type.

pub mod claude_code;
pub mod opencode;
pub mod transcript;

use crate::error::{Error, Result};
use crate::message::{Conversation, NormalizedMessage, Worker};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Which agent CLI a worker runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerKind {
    #[default]
    #[serde(alias = "claudecode", alias = "claude-code")]
    Claude,
    #[serde(alias = "open-code")]
    OpenCode,
}

impl WorkerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::OpenCode => "opencode",
        }
    }
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "claude" | "claudecode" | "claude-code" => Ok(Self::Claude),
            "opencode" | "open-code" => Ok(Self::OpenCode),
            other => Err(Error::Unsupported(other.to_string())),
        }
    }
}

/// Structured result of one agent invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionReply {
    /// Session handle the agent reported; the same one on every resume.
    pub handle: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// Start, resume, archive and read back sessions of one agent CLI.
#[async_trait]
pub trait SessionDriver: Send + Sync {
    fn kind(&self) -> WorkerKind;

    /// Run the agent on a fresh session. The conversation must not have a
    /// handle yet; the reply carries the one the agent assigned.
    async fn start(
        &self,
        worker: &Worker,
        conversation: &Conversation,
        message: &str,
    ) -> Result<SessionReply>;

    /// Continue the conversation's existing session. Fails with
    /// `InvalidState`, without spawning anything, when it has no handle.
    async fn resume(
        &self,
        worker: &Worker,
        conversation: &Conversation,
        message: &str,
    ) -> Result<SessionReply>;

    /// Re-enable auto-sync for an already started conversation, without
    /// invoking the agent. `InvalidState` when it has no handle.
    async fn activate(&self, conversation: &Conversation) -> Result<()>;

    /// Stop auto-syncing `handle`. In-flight invocations are left alone.
    async fn archive(&self, handle: &str) -> Result<()>;

    /// Re-read the agent's own log for this conversation and return the full,
    /// deduplicated message list.
    async fn sync_messages(&self, conversation: &Conversation) -> Result<Vec<NormalizedMessage>>;
}

/// Drivers by worker type.
#[derive(Default, Clone)]
pub struct DriverRegistry {
    drivers: HashMap<WorkerKind, Arc<dyn SessionDriver>>,
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.drivers.keys().map(WorkerKind::as_str).collect();
        kinds.sort_unstable();
        f.debug_struct("DriverRegistry").field("kinds", &kinds).finish()
    }
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, driver: Arc<dyn SessionDriver>) {
        self.drivers.insert(driver.kind(), driver);
    }

    pub fn get(&self, kind: WorkerKind) -> Result<Arc<dyn SessionDriver>> {
        self.drivers
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::Unsupported(kind.to_string()))
    }

    /// Resolve a worker type by name (case-insensitive, `claudecode` accepted).
    pub fn by_name(&self, name: &str) -> Result<Arc<dyn SessionDriver>> {
        self.get(name.parse()?)
    }
}

/// Truncate a string to at most `max` characters (by Unicode char boundary).
pub(crate) fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
