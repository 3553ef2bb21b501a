//! Conversation, worker and record types
//!
//! These are plain data: the service layer serializes them as-is.

use crate::agents::WorkerKind;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;

// ---------------------------------------------------------------------------
// Normalized messages
// ---------------------------------------------------------------------------

/// Kind of transcript entry kept in the message log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    User,
    Assistant,
    QueueOperation,
    System,
}

impl MessageType {
    /// Map the agent's raw `type` field. Other entry kinds (summaries,
    /// file snapshots, progress) are not part of the conversation.
    pub fn from_raw(raw: &str) -> Option<Self> {
        match raw {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "queue-operation" => Some(Self::QueueOperation),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Text,
    ToolUse,
    ToolResult,
    Error,
}

/// One block of a message.
///
/// `content` holds the text, the tool input as JSON, the tool output, or the
/// error text depending on `kind`. `tool_name` is the tool for `ToolUse` and
/// the originating `tool_use_id` for `ToolResult`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub kind: ContentKind,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

impl ContentBlock {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            kind: ContentKind::Text,
            content: content.into(),
            tool_name: None,
        }
    }

    pub fn tool_use(tool_name: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            kind: ContentKind::ToolUse,
            content: input.into(),
            tool_name: Some(tool_name.into()),
        }
    }

    pub fn tool_result(content: impl Into<String>, tool_use_id: Option<String>) -> Self {
        Self {
            kind: ContentKind::ToolResult,
            content: content.into(),
            tool_name: tool_use_id,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            kind: ContentKind::Error,
            content: content.into(),
            tool_name: None,
        }
    }
}

/// Token counters reported by the agent for one assistant turn.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u64>,
}

/// Binary-agnostic representation of one transcript entry.
///
/// `uuid` comes from the agent's own log and is the dedup key within a
/// conversation's message log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedMessage {
    pub uuid: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub contents: Vec<ContentBlock>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Input records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputRole {
    User,
    Assistant,
    System,
}

/// What the caller sent into a conversation. Appended unconditionally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputRecord {
    pub role: InputRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl InputRecord {
    pub fn new(role: InputRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            metadata: Map::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Conversations
// ---------------------------------------------------------------------------

/// Lifecycle of a conversation's agent session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No handle assigned yet.
    Unstarted,
    /// Handle assigned; eligible for auto-sync.
    Active,
    /// Handle retained for reads, no longer auto-synced.
    Archived,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub worker_name: String,
    pub project_path: PathBuf,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(default)]
    pub is_current: bool,
    /// Session handle assigned by the agent binary on the first start.
    #[serde(default)]
    pub raw_conversation_id: Option<String>,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Conversation {
    pub fn new(worker_name: impl Into<String>, project_path: PathBuf, name: Option<String>) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        let name = name.unwrap_or_else(|| format!("Conversation {}", &id[..8]));
        let now = Utc::now();
        Self {
            id,
            worker_name: worker_name.into(),
            project_path,
            name,
            created_at: now,
            last_activity: now,
            is_current: false,
            raw_conversation_id: None,
            archived: false,
            metadata: Map::new(),
        }
    }

    pub fn handle(&self) -> Option<&str> {
        self.raw_conversation_id.as_deref()
    }

    pub fn state(&self) -> SessionState {
        match (&self.raw_conversation_id, self.archived) {
            (None, _) => SessionState::Unstarted,
            (Some(_), false) => SessionState::Active,
            (Some(_), true) => SessionState::Archived,
        }
    }

    /// Handle of a started conversation, or `InvalidState` if it never started.
    pub fn require_handle(&self) -> Result<&str> {
        self.handle().ok_or_else(|| {
            Error::invalid_state(format!(
                "conversation {} has no session handle; start it first",
                self.id
            ))
        })
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
}

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

/// A configured agent binary: which driver runs it and with what extra
/// environment and arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: WorkerKind,
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
    #[serde(default)]
    pub command_params: Vec<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Worker {
    pub fn new(name: impl Into<String>, kind: WorkerKind) -> Result<Self> {
        let name = name.into();
        validate_worker_name(&name)?;
        Ok(Self {
            name,
            kind,
            env_vars: BTreeMap::new(),
            command_params: Vec::new(),
            created_at: Utc::now(),
        })
    }
}

/// Worker names: a letter followed by up to 63 alphanumerics, `-` or `_`.
pub fn validate_worker_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && name.len() <= 64
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidWorkerName(name.to_string()))
    }
}
