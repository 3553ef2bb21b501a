//! Directory watch multiplexer.
//!
//! One OS-level watcher and one dispatch task per watched root directory,
//! fanning change events out to any number of registered callbacks. A file
//! registration is rooted at the file's parent and matches by equality; a
//! directory registration is rooted at the directory itself and matches any
//! path beneath it. A root's watcher and task exist only while at least one
//! registration points at it.

use crate::error::{Error, Result};
use notify::event::EventKind;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Invoked with the changed path. Errors are logged, never propagated.
pub type WatchCallback = Arc<dyn Fn(PathBuf) -> BoxFuture<Result<()>> + Send + Sync>;

/// Box an async closure into a [`WatchCallback`].
pub fn callback<F, Fut>(f: F) -> WatchCallback
where
    F: Fn(PathBuf) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |path| Box::pin(f(path)) as BoxFuture<Result<()>>)
}

/// Identifies one registration; pass it to [`WatchMultiplexer::unwatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    File,
    Directory,
}

struct Registration {
    target: PathBuf,
    scope: Scope,
    root: PathBuf,
    callback: WatchCallback,
}

impl Registration {
    fn matches(&self, path: &Path) -> bool {
        match self.scope {
            Scope::File => path == self.target,
            Scope::Directory => path.starts_with(&self.target),
        }
    }
}

struct RootTask {
    // Dropping the watcher closes the event channel and ends the task.
    watcher: RecommendedWatcher,
    recursive: bool,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct State {
    runtime: Option<Handle>,
    next_id: u64,
    registrations: HashMap<WatchId, Registration>,
    tasks: HashMap<PathBuf, RootTask>,
}

impl State {
    fn root_in_use(&self, root: &Path) -> bool {
        self.registrations.values().any(|r| r.root == root)
    }

    fn wants_recursive(&self, root: &Path) -> bool {
        self.registrations
            .values()
            .any(|r| r.root == root && r.scope == Scope::Directory)
    }
}

struct Inner {
    state: Mutex<State>,
    tasks_stopped: AtomicUsize,
}

#[derive(Clone)]
pub struct WatchMultiplexer {
    inner: Arc<Inner>,
}

impl Default for WatchMultiplexer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WatchMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchMultiplexer")
            .field("running", &self.is_running())
            .field("active_tasks", &self.active_tasks())
            .finish()
    }
}

impl WatchMultiplexer {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                tasks_stopped: AtomicUsize::new(0),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.state().runtime.is_some()
    }

    /// Begin dispatching. Registrations made earlier get their watchers now.
    /// Calling it again while running does nothing. Must be called from within
    /// a tokio runtime.
    pub fn start(&self) -> Result<()> {
        let mut state = self.state();
        if state.runtime.is_some() {
            return Ok(());
        }
        let runtime = Handle::try_current().map_err(|e| {
            Error::invalid_state(format!("watch multiplexer needs a tokio runtime: {e}"))
        })?;
        state.runtime = Some(runtime);

        let mut roots: Vec<PathBuf> = state.registrations.values().map(|r| r.root.clone()).collect();
        roots.sort();
        roots.dedup();

        let mut first_err = None;
        for root in roots {
            if let Err(e) = self.ensure_task(&mut state, &root) {
                warn!(path = %root.display(), error = %e, "failed to start watch");
                state.registrations.retain(|_, r| r.root != root);
                first_err.get_or_insert(e);
            }
        }
        info!("watch multiplexer started");
        first_err.map_or(Ok(()), Err)
    }

    /// Cancel every watch task and drop every registration.
    pub fn stop(&self) {
        let mut state = self.state();
        state.runtime = None;
        state.registrations.clear();
        let tasks: Vec<_> = state.tasks.drain().collect();
        drop(state);

        for (root, task) in tasks {
            self.teardown(&root, task);
        }
        info!("watch multiplexer stopped");
    }

    /// Invoke `callback` whenever `path` itself is created, modified or removed.
    pub fn watch_file(&self, path: &Path, callback: WatchCallback) -> Result<WatchId> {
        let target = resolve(path);
        let root = target
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| Error::not_found(format!("parent of {}", target.display())))?;
        self.register(target, root, Scope::File, callback)
    }

    /// Invoke `callback` for any change anywhere beneath `dir`, recursively.
    pub fn watch_directory(&self, dir: &Path, callback: WatchCallback) -> Result<WatchId> {
        let target = resolve(dir);
        let root = target.clone();
        self.register(target, root, Scope::Directory, callback)
    }

    fn register(
        &self,
        target: PathBuf,
        root: PathBuf,
        scope: Scope,
        callback: WatchCallback,
    ) -> Result<WatchId> {
        let mut state = self.state();
        let id = WatchId(state.next_id);
        state.next_id += 1;
        state.registrations.insert(
            id,
            Registration {
                target: target.clone(),
                scope,
                root: root.clone(),
                callback,
            },
        );

        if state.runtime.is_some() {
            if let Err(e) = self.ensure_task(&mut state, &root) {
                state.registrations.remove(&id);
                return Err(e);
            }
        }
        debug!(path = %target.display(), root = %root.display(), ?scope, "watch registered");
        Ok(id)
    }

    /// Remove one registration. Returns whether it existed.
    pub fn unwatch(&self, id: WatchId) -> bool {
        let mut state = self.state();
        let Some(reg) = state.registrations.remove(&id) else {
            return false;
        };
        debug!(path = %reg.target.display(), "watch removed");
        self.release_root(state, &reg.root);
        true
    }

    /// Remove every registration for `path`. Returns how many were removed.
    pub fn unwatch_path(&self, path: &Path) -> usize {
        let target = resolve(path);
        let mut state = self.state();
        let ids: Vec<WatchId> = state
            .registrations
            .iter()
            .filter(|(_, r)| r.target == target)
            .map(|(id, _)| *id)
            .collect();

        let mut roots = Vec::new();
        for id in &ids {
            if let Some(reg) = state.registrations.remove(id) {
                roots.push(reg.root);
            }
        }
        roots.sort();
        roots.dedup();

        let mut idle = Vec::new();
        for root in roots {
            if !state.root_in_use(&root) {
                if let Some(task) = state.tasks.remove(&root) {
                    idle.push((root, task));
                }
            }
        }
        drop(state);
        for (root, task) in idle {
            self.teardown(&root, task);
        }
        ids.len()
    }

    /// Number of live per-root watch tasks.
    pub fn active_tasks(&self) -> usize {
        self.state().tasks.len()
    }

    /// Number of watch tasks torn down so far.
    pub fn tasks_stopped(&self) -> usize {
        self.inner.tasks_stopped.load(Ordering::SeqCst)
    }

    pub fn registrations(&self) -> usize {
        self.state().registrations.len()
    }

    fn release_root(&self, mut state: MutexGuard<'_, State>, root: &Path) {
        if state.root_in_use(root) {
            return;
        }
        let task = state.tasks.remove(root);
        drop(state);
        if let Some(task) = task {
            self.teardown(root, task);
        }
    }

    fn teardown(&self, root: &Path, task: RootTask) {
        task.handle.abort();
        self.inner.tasks_stopped.fetch_add(1, Ordering::SeqCst);
        debug!(path = %root.display(), "watch task stopped");
    }

    fn ensure_task(&self, state: &mut State, root: &Path) -> Result<()> {
        let recursive = state.wants_recursive(root);
        if let Some(task) = state.tasks.get_mut(root) {
            if recursive && !task.recursive {
                task.watcher
                    .watch(root, RecursiveMode::Recursive)
                    .map_err(|source| Error::WatchSetupFailed {
                        path: root.to_path_buf(),
                        source,
                    })?;
                task.recursive = true;
            }
            return Ok(());
        }

        let Some(runtime) = state.runtime.clone() else {
            return Ok(());
        };
        let task = spawn_root(Arc::downgrade(&self.inner), &runtime, root, recursive)?;
        state.tasks.insert(root.to_path_buf(), task);
        debug!(path = %root.display(), recursive, "watch task started");
        Ok(())
    }
}

fn spawn_root(
    inner: Weak<Inner>,
    runtime: &Handle,
    root: &Path,
    recursive: bool,
) -> Result<RootTask> {
    let setup_failed = |source| Error::WatchSetupFailed {
        path: root.to_path_buf(),
        source,
    };

    let (tx, rx) = mpsc::unbounded_channel::<notify::Event>();
    let cb_root = root.to_path_buf();
    let mut watcher =
        notify::recommended_watcher(move |res: std::result::Result<notify::Event, notify::Error>| {
            match res {
                Ok(event) => {
                    let _ = tx.send(event);
                }
                Err(err) => debug!(path = %cb_root.display(), error = %err, "watch backend error"),
            }
        })
        .map_err(setup_failed)?;

    let mode = if recursive {
        RecursiveMode::Recursive
    } else {
        RecursiveMode::NonRecursive
    };
    watcher.watch(root, mode).map_err(setup_failed)?;

    let handle = runtime.spawn(dispatch_loop(inner, root.to_path_buf(), rx));
    Ok(RootTask {
        watcher,
        recursive,
        handle,
    })
}

async fn dispatch_loop(inner: Weak<Inner>, root: PathBuf, mut rx: mpsc::UnboundedReceiver<notify::Event>) {
    while let Some(event) = rx.recv().await {
        if !is_change(&event.kind) {
            continue;
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };

        for path in event.paths {
            let callbacks: Vec<WatchCallback> = {
                let state = inner.state.lock().unwrap_or_else(PoisonError::into_inner);
                state
                    .registrations
                    .values()
                    .filter(|r| r.root == root && r.matches(&path))
                    .map(|r| Arc::clone(&r.callback))
                    .collect()
            };

            for cb in callbacks {
                let path = path.clone();
                tokio::spawn(async move {
                    if let Err(e) = cb(path.clone()).await {
                        warn!(path = %path.display(), error = %e, "watch callback failed");
                    }
                });
            }
        }
    }
    debug!(path = %root.display(), "watch dispatch loop exited");
}

fn is_change(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Any | EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

/// Canonical form of `path`; for a path that does not exist yet, the
/// canonical parent joined with the file name.
fn resolve(path: &Path) -> PathBuf {
    if let Ok(p) = std::fs::canonicalize(path) {
        return p;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => std::fs::canonicalize(parent)
            .map(|p| p.join(name))
            .unwrap_or_else(|_| path.to_path_buf()),
        _ => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    const EXPECT: Duration = Duration::from_secs(5);
    const QUIET: Duration = Duration::from_millis(300);

    fn channel_callback(tx: mpsc::UnboundedSender<PathBuf>) -> WatchCallback {
        callback(move |path| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(path);
                Ok::<_, Error>(())
            }
        })
    }

    async fn expect_path(rx: &mut mpsc::UnboundedReceiver<PathBuf>, want: &Path) {
        let deadline = tokio::time::Instant::now() + EXPECT;
        loop {
            let got = tokio::time::timeout_at(deadline, rx.recv())
                .await
                .expect("callback not invoked in time")
                .expect("channel closed");
            if got == want {
                return;
            }
        }
    }

    async fn expect_silence(rx: &mut mpsc::UnboundedReceiver<PathBuf>) {
        assert!(tokio::time::timeout(QUIET, rx.recv()).await.is_err());
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<PathBuf>) {
        while rx.try_recv().is_ok() {}
    }

    #[tokio::test]
    async fn fans_out_and_tears_down_when_idle() {
        let tmp = TempDir::new().unwrap();
        let dir = resolve(tmp.path());
        let mux = WatchMultiplexer::new();
        mux.start().unwrap();

        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = mux.watch_directory(&dir, channel_callback(tx_a)).unwrap();
        let b = mux.watch_directory(&dir, channel_callback(tx_b)).unwrap();
        assert_eq!(mux.active_tasks(), 1);

        let first = dir.join("first.jsonl");
        std::fs::write(&first, "x\n").unwrap();
        expect_path(&mut rx_a, &first).await;
        expect_path(&mut rx_b, &first).await;

        assert!(mux.unwatch(a));
        assert_eq!(mux.active_tasks(), 1);
        tokio::time::sleep(QUIET).await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        let second = dir.join("second.jsonl");
        std::fs::write(&second, "y\n").unwrap();
        expect_path(&mut rx_b, &second).await;
        expect_silence(&mut rx_a).await;

        assert!(mux.unwatch(b));
        assert_eq!(mux.active_tasks(), 0);
        assert_eq!(mux.tasks_stopped(), 1);
        assert!(!mux.unwatch(b));
    }

    #[tokio::test]
    async fn file_watch_matches_exact_path_only() {
        let tmp = TempDir::new().unwrap();
        let dir = resolve(tmp.path());
        let mux = WatchMultiplexer::new();
        mux.start().unwrap();

        let target = dir.join("target.jsonl");
        let (tx, mut rx) = mpsc::unbounded_channel();
        mux.watch_file(&target, channel_callback(tx)).unwrap();

        std::fs::write(dir.join("other.jsonl"), "x\n").unwrap();
        expect_silence(&mut rx).await;

        std::fs::write(&target, "y\n").unwrap();
        expect_path(&mut rx, &target).await;

        assert_eq!(mux.unwatch_path(&target), 1);
        assert_eq!(mux.active_tasks(), 0);
    }

    #[tokio::test]
    async fn failing_callback_does_not_block_others() {
        let tmp = TempDir::new().unwrap();
        let dir = resolve(tmp.path());
        let mux = WatchMultiplexer::new();
        mux.start().unwrap();

        mux.watch_directory(
            &dir,
            callback(|path: PathBuf| async move {
                Err::<(), _>(Error::not_found(path.display().to_string()))
            }),
        )
        .unwrap();
        mux.watch_directory(
            &dir,
            callback(|path: PathBuf| async move {
                assert!(path.as_os_str().is_empty(), "callback panicked");
                Ok::<_, Error>(())
            }),
        )
        .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        mux.watch_directory(&dir, channel_callback(tx)).unwrap();

        let file = dir.join("a.jsonl");
        std::fs::write(&file, "x\n").unwrap();
        expect_path(&mut rx, &file).await;

        let again = dir.join("b.jsonl");
        std::fs::write(&again, "x\n").unwrap();
        expect_path(&mut rx, &again).await;
    }

    #[tokio::test]
    async fn registrations_before_start_get_watchers_on_start() {
        let tmp = TempDir::new().unwrap();
        let dir = resolve(tmp.path());
        let mux = WatchMultiplexer::new();

        let (tx, mut rx) = mpsc::unbounded_channel();
        mux.watch_directory(&dir, channel_callback(tx)).unwrap();
        assert_eq!(mux.active_tasks(), 0);

        mux.start().unwrap();
        mux.start().unwrap();
        assert_eq!(mux.active_tasks(), 1);

        let file = dir.join("late.jsonl");
        std::fs::write(&file, "x\n").unwrap();
        expect_path(&mut rx, &file).await;
    }

    #[tokio::test]
    async fn nested_subdirectory_changes_reach_directory_watch() {
        let tmp = TempDir::new().unwrap();
        let dir = resolve(tmp.path());
        let sub = dir.join("project-a");
        std::fs::create_dir(&sub).unwrap();

        let mux = WatchMultiplexer::new();
        mux.start().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        mux.watch_directory(&dir, channel_callback(tx)).unwrap();

        let file = sub.join("abc123.jsonl");
        std::fs::write(&file, "x\n").unwrap();
        expect_path(&mut rx, &file).await;
    }

    #[tokio::test]
    async fn stop_clears_everything() {
        let tmp = TempDir::new().unwrap();
        let mux = WatchMultiplexer::new();
        mux.start().unwrap();
        mux.watch_directory(tmp.path(), callback(|_| async { Ok::<_, Error>(()) }))
            .unwrap();
        mux.watch_file(&tmp.path().join("x.jsonl"), callback(|_| async { Ok::<_, Error>(()) }))
            .unwrap();
        assert_eq!(mux.registrations(), 2);
        assert_eq!(mux.active_tasks(), 1);

        mux.stop();
        assert!(!mux.is_running());
        assert_eq!(mux.registrations(), 0);
        assert_eq!(mux.active_tasks(), 0);
        assert_eq!(mux.tasks_stopped(), 1);
    }

    #[tokio::test]
    async fn missing_directory_fails_setup_and_rolls_back() {
        let tmp = TempDir::new().unwrap();
        let mux = WatchMultiplexer::new();
        mux.start().unwrap();

        let err = mux
            .watch_directory(&tmp.path().join("missing"), callback(|_| async { Ok::<_, Error>(()) }))
            .unwrap_err();
        assert!(matches!(err, Error::WatchSetupFailed { .. }));
        assert_eq!(mux.registrations(), 0);
        assert_eq!(mux.active_tasks(), 0);
    }

    #[test]
    fn start_outside_runtime_is_rejected() {
        let mux = WatchMultiplexer::new();
        assert!(matches!(mux.start(), Err(Error::InvalidState(_))));
        assert!(!mux.is_running());
    }
}
