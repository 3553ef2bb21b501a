//! Claude Code session driver
//!
//! Every turn is one non-interactive invocation:
//!
//! ```text
//! claude -p --output-format json [--resume <session id>] [worker params...] <message>
//! ```
//!
//! run in the conversation's project directory. The CLI prints a single JSON
//! document when it finishes; its `session_id` is the handle used to resume.
//! The full transcript is only available in the CLI's own log, which is
//! watched and re-synced into the record store while the handle is active.

use super::transcript;
use super::{SessionDriver, SessionReply, WorkerKind, truncate};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::message::{Conversation, NormalizedMessage, Worker};
use crate::registry::{ActiveSession, SessionRegistry};
use crate::store::RecordStore;
use crate::watch;
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::process::Command;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Turn {
    Start,
    Resume,
}

impl Turn {
    fn failed(self, message: String) -> Error {
        match self {
            Self::Start => Error::SessionStartFailed { message },
            Self::Resume => Error::SessionContinueFailed { message },
        }
    }
}

#[derive(Debug)]
pub struct ClaudeCodeDriver {
    binary: PathBuf,
    projects_root: PathBuf,
    store: Arc<RecordStore>,
    registry: Arc<SessionRegistry>,
    degraded: AtomicBool,
}

impl ClaudeCodeDriver {
    pub fn new(
        binary: impl Into<PathBuf>,
        claude_home: &Path,
        store: Arc<RecordStore>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            binary: binary.into(),
            projects_root: transcript::projects_dir(claude_home),
            store,
            registry,
            degraded: AtomicBool::new(false),
        }
    }

    pub fn from_config(config: &Config, store: Arc<RecordStore>, registry: Arc<SessionRegistry>) -> Self {
        Self::new(&config.claude_binary, &config.claude_home, store, registry)
    }

    /// Directory the CLI writes transcripts under.
    pub fn projects_root(&self) -> &Path {
        &self.projects_root
    }

    /// True when the transcript watch could not be set up; conversations
    /// still work but only update on an explicit sync.
    pub fn auto_sync_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    fn command(&self, worker: &Worker, project_path: &Path, message: &str, resume: Option<&str>) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-p").args(["--output-format", "json"]);
        if let Some(handle) = resume {
            cmd.args(["--resume", handle]);
        }
        cmd.args(&worker.command_params)
            .arg(message)
            .current_dir(project_path)
            .envs(&worker.env_vars)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    async fn invoke(
        &self,
        turn: Turn,
        worker: &Worker,
        conversation: &Conversation,
        message: &str,
        resume: Option<&str>,
    ) -> Result<SessionReply> {
        let mut cmd = self.command(worker, &conversation.project_path, message, resume);
        debug!(
            binary = %self.binary.display(),
            cwd = %conversation.project_path.display(),
            resume = resume.unwrap_or(""),
            "invoking claude"
        );

        let output = cmd.output().await.map_err(|e| {
            turn.failed(format!("failed to run {}: {e}", self.binary.display()))
        })?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            let detail = failure_detail(&stdout, &stderr, output.status);
            warn!(
                conversation_id = %conversation.id,
                status = %output.status,
                stderr = truncate(stderr.trim(), 200),
                "claude invocation failed"
            );
            return Err(turn.failed(detail));
        }

        parse_reply(&stdout).ok_or_else(|| {
            let detail = if stdout.trim().is_empty() {
                format!("no session_id in output; stderr: {}", stderr.trim())
            } else {
                format!("no session_id in output: {}", stdout.trim())
            };
            turn.failed(detail)
        })
    }

    /// Activate `handle`, make sure its log root is watched, then mirror the
    /// transcript once. The CLI writes the turn's records while it runs,
    /// before the handle is active, so no watch event would cover them.
    async fn register_active(&self, handle: &str, conversation: &Conversation) {
        let session = ActiveSession {
            conversation_id: conversation.id.clone(),
            worker_name: conversation.worker_name.clone(),
            project_path: conversation.project_path.clone(),
        };
        self.registry.activate(handle, session.clone());
        self.ensure_auto_sync().await;
        self.catch_up(handle, &session).await;
    }

    async fn catch_up(&self, handle: &str, session: &ActiveSession) {
        let path =
            match transcript::locate_session_file(&self.projects_root, &session.project_path, handle)
                .await
            {
                Ok(path) => path,
                Err(e) if e.is_not_found() => return,
                Err(e) => {
                    warn!(handle, error = %e, "could not locate transcript");
                    return;
                }
            };
        match mirror_transcript(&self.store, &self.registry, handle, session, &path).await {
            Ok(Some(count)) => {
                debug!(conversation_id = %session.conversation_id, handle, count, "transcript caught up");
            }
            Ok(None) => {}
            Err(e) => warn!(handle, error = %e, "transcript catch-up failed"),
        }
    }

    /// Watch the transcript root once; failure degrades to manual sync.
    async fn ensure_auto_sync(&self) {
        let root = &self.projects_root;
        if self.registry.is_watching(root) {
            return;
        }
        if let Err(e) = tokio::fs::create_dir_all(root).await {
            debug!(path = %root.display(), error = %e, "could not create transcript root");
        }

        let callback = auto_sync_callback(
            Arc::clone(&self.store),
            Arc::downgrade(&self.registry),
        );
        match self.registry.ensure_watching(root, callback) {
            Ok(_) => self.degraded.store(false, Ordering::SeqCst),
            Err(e) => {
                warn!(
                    path = %root.display(),
                    error = %e,
                    "transcript watch unavailable; messages update on manual sync only"
                );
                self.degraded.store(true, Ordering::SeqCst);
            }
        }
    }
}

#[async_trait]
impl SessionDriver for ClaudeCodeDriver {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Claude
    }

    async fn start(
        &self,
        worker: &Worker,
        conversation: &Conversation,
        message: &str,
    ) -> Result<SessionReply> {
        if let Some(handle) = conversation.handle() {
            return Err(Error::invalid_state(format!(
                "conversation {} already has session {handle}",
                conversation.id
            )));
        }

        let reply = self.invoke(Turn::Start, worker, conversation, message, None).await?;
        self.register_active(&reply.handle, conversation).await;
        info!(conversation_id = %conversation.id, handle = %reply.handle, "claude session started");
        Ok(reply)
    }

    async fn resume(
        &self,
        worker: &Worker,
        conversation: &Conversation,
        message: &str,
    ) -> Result<SessionReply> {
        let handle = conversation.require_handle()?;

        let reply = self
            .invoke(Turn::Resume, worker, conversation, message, Some(handle))
            .await?;
        if reply.handle != handle {
            warn!(
                conversation_id = %conversation.id,
                handle,
                reported = %reply.handle,
                "claude reported a different session id on resume; keeping the original"
            );
        }
        self.register_active(handle, conversation).await;
        debug!(conversation_id = %conversation.id, handle, "claude session resumed");
        Ok(reply)
    }

    async fn activate(&self, conversation: &Conversation) -> Result<()> {
        let handle = conversation.require_handle()?;
        self.register_active(handle, conversation).await;
        Ok(())
    }

    async fn archive(&self, handle: &str) -> Result<()> {
        if self.registry.deactivate(handle).is_some() {
            info!(handle, "claude session archived");
        }
        Ok(())
    }

    async fn sync_messages(&self, conversation: &Conversation) -> Result<Vec<NormalizedMessage>> {
        let handle = conversation.require_handle()?;
        let path =
            transcript::locate_session_file(&self.projects_root, &conversation.project_path, handle)
                .await?;
        transcript::load_transcript(&path).await
    }
}

/// Watch callback: re-sync an active session whose transcript changed.
fn auto_sync_callback(store: Arc<RecordStore>, registry: Weak<SessionRegistry>) -> watch::WatchCallback {
    watch::callback(move |path: PathBuf| {
        let store = Arc::clone(&store);
        let registry = registry.clone();
        async move {
            let Some(handle) = transcript::handle_from_log_path(&path) else {
                return Ok(());
            };
            let Some(registry) = registry.upgrade() else {
                return Ok(());
            };
            let Some(session) = registry.get(handle) else {
                trace!(path = %path.display(), "change for inactive session ignored");
                return Ok(());
            };

            if let Some(count) = mirror_transcript(&store, &registry, handle, &session, &path).await? {
                debug!(
                    conversation_id = %session.conversation_id,
                    handle,
                    count,
                    "auto-synced transcript"
                );
            }
            Ok::<_, Error>(())
        }
    })
}

/// Replace the conversation's message log with the transcript at `path`.
///
/// Runs under the conversation's sync lock and only while `handle` is still
/// active for the same conversation, so a sync queued behind a delete or an
/// archive writes nothing. Returns `None` when skipped or when the
/// transcript is gone.
async fn mirror_transcript(
    store: &RecordStore,
    registry: &SessionRegistry,
    handle: &str,
    session: &ActiveSession,
    path: &Path,
) -> Result<Option<usize>> {
    let lock = store.sync_lock(&session.conversation_id);
    let _guard = lock.lock().await;

    let still_active = registry
        .get(handle)
        .is_some_and(|current| current.conversation_id == session.conversation_id);
    if !still_active {
        trace!(handle, conversation_id = %session.conversation_id, "session deactivated while waiting");
        return Ok(None);
    }

    let messages = match transcript::load_transcript(path).await {
        Ok(messages) => messages,
        // Removed or renamed away; nothing to sync.
        Err(e) if e.is_not_found() => return Ok(None),
        Err(e) => return Err(e),
    };
    let count = store
        .overwrite_messages(&session.worker_name, &session.conversation_id, &messages)
        .await?;
    Ok(Some(count))
}

/// Extract the reply from `claude -p --output-format json` stdout. The whole
/// output is normally one document; otherwise the last parsable line wins.
/// Some CLI versions print an array of events ending with the result.
pub(crate) fn parse_reply(stdout: &str) -> Option<SessionReply> {
    let trimmed = stdout.trim();
    let value: Value = serde_json::from_str(trimmed).ok().or_else(|| {
        trimmed
            .lines()
            .rev()
            .find_map(|line| serde_json::from_str(line.trim()).ok())
    })?;

    let doc = match &value {
        Value::Array(items) => items.iter().rev().find(|v| v.get("session_id").is_some())?,
        other => other,
    };

    let handle = doc
        .get("session_id")?
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())?
        .to_string();

    Some(SessionReply {
        handle,
        result: doc.get("result").and_then(Value::as_str).map(ToString::to_string),
        is_error: doc.get("is_error").and_then(Value::as_bool).unwrap_or(false),
        total_cost_usd: doc.get("total_cost_usd").and_then(Value::as_f64),
        duration_ms: doc.get("duration_ms").and_then(Value::as_u64),
    })
}

/// Error text for a failed invocation: stderr verbatim, else stdout, else
/// the exit status.
fn failure_detail(stdout: &str, stderr: &str, status: std::process::ExitStatus) -> String {
    let stderr = stderr.trim();
    if !stderr.is_empty() {
        return stderr.to_string();
    }
    let stdout = stdout.trim();
    if !stdout.is_empty() {
        // A JSON error reply carries its text in `result`.
        if let Some(text) = serde_json::from_str::<Value>(stdout)
            .ok()
            .and_then(|v| v.get("result").and_then(Value::as_str).map(ToString::to_string))
        {
            return text;
        }
        return stdout.to_string();
    }
    format!("claude exited with {status}")
}
