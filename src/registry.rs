//! Session registry - the process-wide activation set
//!
//! Tracks which agent session handles are eligible for auto-sync and owns the
//! directory watches that feed them. One instance is created at startup and
//! shared (`Arc<SessionRegistry>`) with every driver.

use crate::error::Result;
use crate::watch::{WatchCallback, WatchId, WatchMultiplexer};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

/// What an active handle syncs into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSession {
    pub conversation_id: String,
    pub worker_name: String,
    pub project_path: PathBuf,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    active: Mutex<HashMap<String, ActiveSession>>,
    log_roots: Mutex<HashMap<PathBuf, WatchId>>,
    watcher: WatchMultiplexer,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn active(&self) -> MutexGuard<'_, HashMap<String, ActiveSession>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn log_roots(&self) -> MutexGuard<'_, HashMap<PathBuf, WatchId>> {
        self.log_roots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark `handle` eligible for auto-sync. Re-activating an active handle
    /// keeps the existing entry. Returns whether the handle was newly added.
    pub fn activate(&self, handle: &str, session: ActiveSession) -> bool {
        let mut active = self.active();
        if active.contains_key(handle) {
            return false;
        }
        debug!(handle, conversation_id = %session.conversation_id, "session activated");
        active.insert(handle.to_string(), session);
        true
    }

    /// Stop auto-syncing `handle`. Absent handles are ignored.
    pub fn deactivate(&self, handle: &str) -> Option<ActiveSession> {
        let removed = self.active().remove(handle);
        if removed.is_some() {
            debug!(handle, "session deactivated");
        }
        removed
    }

    pub fn is_active(&self, handle: &str) -> bool {
        self.active().contains_key(handle)
    }

    pub fn get(&self, handle: &str) -> Option<ActiveSession> {
        self.active().get(handle).cloned()
    }

    pub fn len(&self) -> usize {
        self.active().len()
    }

    pub fn is_empty(&self) -> bool {
        self.active().is_empty()
    }

    /// Active handles, sorted.
    pub fn handles(&self) -> Vec<String> {
        let mut handles: Vec<String> = self.active().keys().cloned().collect();
        handles.sort();
        handles
    }

    /// Register `callback` on `root` unless a watch for it already exists.
    /// Returns whether a new watch was set up.
    pub fn ensure_watching(&self, root: &Path, callback: WatchCallback) -> Result<bool> {
        let mut roots = self.log_roots();
        if roots.contains_key(root) {
            return Ok(false);
        }
        self.watcher.start()?;
        let id = self.watcher.watch_directory(root, callback)?;
        roots.insert(root.to_path_buf(), id);
        info!(path = %root.display(), "watching agent log root");
        Ok(true)
    }

    pub fn is_watching(&self, root: &Path) -> bool {
        self.log_roots().contains_key(root)
    }

    /// Drop the watch on `root`, if any.
    pub fn stop_watching(&self, root: &Path) -> bool {
        match self.log_roots().remove(root) {
            Some(id) => self.watcher.unwatch(id),
            None => false,
        }
    }

    pub fn multiplexer(&self) -> &WatchMultiplexer {
        &self.watcher
    }

    /// Deactivate every handle and tear down all watches. Used at shutdown.
    pub fn stop_all(&self) {
        let handles = {
            let mut active = self.active();
            let n = active.len();
            active.clear();
            n
        };
        self.log_roots().clear();
        self.watcher.stop();
        info!(handles, "session registry stopped");
    }
}
