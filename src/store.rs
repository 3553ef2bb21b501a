//! Append-only record store for conversation inputs and normalized messages.
//!
//! Layout, sharded by the first two characters of the conversation id:
//!
//! ```text
//! <root>/<worker>/<id[..2]>/<id>.input.jsonl     appended, never rewritten
//! <root>/<worker>/<id[..2]>/<id>.messages.jsonl  replaced atomically on sync
//! ```

use crate::error::{Error, Result};
use crate::message::{InputRecord, NormalizedMessage};
use crate::tail;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

const INPUT_EXT: &str = "input.jsonl";
const MESSAGES_EXT: &str = "messages.jsonl";

#[derive(Debug)]
pub struct RecordStore {
    root: PathBuf,
    block_size: usize,
    sync_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl RecordStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            block_size: tail::DEFAULT_BLOCK_SIZE,
            sync_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Block size used when tailing record files.
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size.max(1);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn shard_dir(&self, worker: &str, conversation_id: &str) -> PathBuf {
        self.root.join(worker).join(shard(conversation_id))
    }

    pub fn input_path(&self, worker: &str, conversation_id: &str) -> PathBuf {
        self.shard_dir(worker, conversation_id)
            .join(format!("{conversation_id}.{INPUT_EXT}"))
    }

    pub fn messages_path(&self, worker: &str, conversation_id: &str) -> PathBuf {
        self.shard_dir(worker, conversation_id)
            .join(format!("{conversation_id}.{MESSAGES_EXT}"))
    }

    // -----------------------------------------------------------------------
    // Inputs
    // -----------------------------------------------------------------------

    /// Append one input record. Every call appends; nothing is deduplicated.
    pub async fn append_input(
        &self,
        worker: &str,
        conversation_id: &str,
        record: &InputRecord,
    ) -> Result<()> {
        let path = self.input_path(worker, conversation_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// The most recent `limit` inputs (all when `None`), oldest first.
    /// A conversation without inputs yields an empty list.
    pub async fn read_inputs(
        &self,
        worker: &str,
        conversation_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<InputRecord>> {
        let path = self.input_path(worker, conversation_id);
        read_records(&path, limit, self.block_size).await
    }

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    /// Replace the message log with `messages`, atomically. Returns the
    /// number of messages written.
    pub async fn overwrite_messages(
        &self,
        worker: &str,
        conversation_id: &str,
        messages: &[NormalizedMessage],
    ) -> Result<usize> {
        let path = self.messages_path(worker, conversation_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let data = encode_jsonl(messages)?;
        let target = path.clone();
        tokio::task::spawn_blocking(move || atomic_write(&target, &data))
            .await
            .map_err(std::io::Error::other)??;

        debug!(path = %path.display(), count = messages.len(), "message log rewritten");
        Ok(messages.len())
    }

    /// The most recent `limit` messages (all when `None`), in log order.
    pub async fn read_messages(
        &self,
        worker: &str,
        conversation_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<NormalizedMessage>> {
        let path = self.messages_path(worker, conversation_id);
        read_records(&path, limit, self.block_size).await
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    pub async fn conversation_exists(&self, worker: &str, conversation_id: &str) -> bool {
        for path in [
            self.input_path(worker, conversation_id),
            self.messages_path(worker, conversation_id),
        ] {
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return true;
            }
        }
        false
    }

    /// Delete both record files and the shard directory if it ends up empty.
    /// Already-absent files are not an error. Returns whether anything was
    /// removed.
    pub async fn delete_conversation(&self, worker: &str, conversation_id: &str) -> Result<bool> {
        let mut removed = false;
        for path in [
            self.input_path(worker, conversation_id),
            self.messages_path(worker, conversation_id),
        ] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed = true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        // Fails while other conversations share the shard; that is fine.
        let _ = tokio::fs::remove_dir(self.shard_dir(worker, conversation_id)).await;

        if let Ok(mut locks) = self.sync_locks.lock() {
            locks.remove(conversation_id);
        }
        Ok(removed)
    }

    /// Lock serializing sync-and-overwrite for one conversation. Hold it from
    /// reading the agent log until the overwrite completes so an older
    /// snapshot can never replace a newer one.
    pub fn sync_lock(&self, conversation_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        match self.sync_locks.lock() {
            Ok(mut locks) => Arc::clone(locks.entry(conversation_id.to_string()).or_default()),
            // Poisoned map: hand out a private lock rather than failing the sync.
            Err(_) => Arc::new(tokio::sync::Mutex::new(())),
        }
    }
}

fn shard(conversation_id: &str) -> &str {
    match conversation_id.char_indices().nth(2) {
        Some((idx, _)) => &conversation_id[..idx],
        None => conversation_id,
    }
}

fn encode_jsonl<T: Serialize>(records: &[T]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for record in records {
        serde_json::to_writer(&mut out, record)?;
        out.push(b'\n');
    }
    Ok(out)
}

async fn read_records<T: DeserializeOwned>(
    path: &Path,
    limit: Option<usize>,
    block_size: usize,
) -> Result<Vec<T>> {
    let lines = match limit {
        Some(n) => tail_non_blank(path, n, block_size).await,
        None => read_all_lines(path).await,
    };
    let lines = match lines {
        Ok(lines) => lines,
        Err(e) if e.is_not_found() => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut out = Vec::with_capacity(lines.len());
    for (idx, line) in lines.iter().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(record) => out.push(record),
            Err(e) => {
                // A concurrent append may leave a torn line; skip it.
                let skipped = Error::ParseSkipped {
                    path: path.to_path_buf(),
                    line: idx + 1,
                    message: e.to_string(),
                };
                warn!(error = %skipped, "skipping malformed record");
            }
        }
    }
    Ok(out)
}

/// Last `n` non-blank lines. Blank lines do not count toward `n`, so the
/// window is widened until it holds `n` of them or covers the whole file.
async fn tail_non_blank(path: &Path, n: usize, block_size: usize) -> Result<Vec<String>> {
    let mut want = n;
    loop {
        let mut lines = tail::read_last_lines_with(path, want, block_size).await?;
        let exhausted = lines.len() < want;
        lines.retain(|l| !l.trim().is_empty());
        if exhausted || lines.len() >= n {
            let skip = lines.len().saturating_sub(n);
            return Ok(lines.split_off(skip));
        }
        want += n - lines.len();
    }
}

async fn read_all_lines(path: &Path) -> Result<Vec<String>> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| Error::from_io_at(e, path))?;
    Ok(String::from_utf8_lossy(&bytes)
        .lines()
        .map(String::from)
        .collect())
}

/// Write bytes to a file atomically: write to a temp file in the same
/// directory, then rename over the target. Readers see the old or the new
/// content, never a mix.
pub(crate) fn atomic_write(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    let parent = path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no parent")
    })?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(data)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ContentBlock, InputRole, MessageType};
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn store() -> (TempDir, RecordStore) {
        let tmp = TempDir::new().unwrap();
        let store = RecordStore::new(tmp.path());
        (tmp, store)
    }

    fn message(uuid: &str, text: &str) -> NormalizedMessage {
        NormalizedMessage {
            uuid: uuid.to_string(),
            kind: MessageType::User,
            contents: vec![ContentBlock::text(text)],
            timestamp: Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap(),
            parent_uuid: None,
            model: None,
            usage: None,
            error: None,
        }
    }

    #[test]
    fn shard_uses_two_char_prefix() {
        assert_eq!(shard("abcdef"), "ab");
        assert_eq!(shard("a"), "a");
        assert_eq!(shard("éèx"), "éè");
    }

    #[tokio::test]
    async fn append_creates_sharded_file() {
        let (tmp, store) = store();
        store
            .append_input("myworker", "abcdef1234567890", &InputRecord::new(InputRole::User, "t"))
            .await
            .unwrap();
        let expected = tmp
            .path()
            .join("myworker")
            .join("ab")
            .join("abcdef1234567890.input.jsonl");
        assert!(expected.exists());
    }

    #[tokio::test]
    async fn inputs_come_back_oldest_first_within_limit() {
        let (_tmp, store) = store();
        for i in 0..10 {
            store
                .append_input("w1", "c1234567", &InputRecord::new(InputRole::User, format!("msg{i}")))
                .await
                .unwrap();
        }

        let last3 = store.read_inputs("w1", "c1234567", Some(3)).await.unwrap();
        let contents: Vec<_> = last3.iter().map(|r| r.content.as_str()).collect();
        assert_eq!(contents, ["msg7", "msg8", "msg9"]);

        let all = store.read_inputs("w1", "c1234567", None).await.unwrap();
        assert_eq!(all.len(), 10);
        assert_eq!(all[0].content, "msg0");
    }

    #[tokio::test]
    async fn missing_logs_read_as_empty() {
        let (_tmp, store) = store();
        assert!(store.read_inputs("w1", "nonexistent", Some(5)).await.unwrap().is_empty());
        assert!(store.read_messages("w1", "nonexistent", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn torn_input_lines_are_skipped() {
        let (_tmp, store) = store();
        store
            .append_input("w1", "c1234567", &InputRecord::new(InputRole::User, "first"))
            .await
            .unwrap();
        let path = store.input_path("w1", "c1234567");
        let mut raw = std::fs::read_to_string(&path).unwrap();
        raw.push_str("{\"role\":\"user\",\"cont\n");
        std::fs::write(&path, raw).unwrap();
        store
            .append_input("w1", "c1234567", &InputRecord::new(InputRole::User, "second"))
            .await
            .unwrap();

        let inputs = store.read_inputs("w1", "c1234567", Some(10)).await.unwrap();
        let contents: Vec<_> = inputs.iter().map(|r| r.content.as_str()).collect();
        assert_eq!(contents, ["first", "second"]);
    }

    #[tokio::test]
    async fn blank_lines_do_not_count_toward_limit() {
        let (_tmp, store) = store();
        let path = store.input_path("w1", "c1234567");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut raw = String::new();
        for i in 0..5 {
            let record = InputRecord::new(InputRole::User, format!("msg{i}"));
            raw.push_str(&serde_json::to_string(&record).unwrap());
            raw.push_str("\n\n  \n");
        }
        std::fs::write(&path, raw).unwrap();

        let last3 = store.read_inputs("w1", "c1234567", Some(3)).await.unwrap();
        let contents: Vec<_> = last3.iter().map(|r| r.content.as_str()).collect();
        assert_eq!(contents, ["msg2", "msg3", "msg4"]);

        let all = store.read_inputs("w1", "c1234567", Some(50)).await.unwrap();
        assert_eq!(all.len(), 5);
    }

    #[tokio::test]
    async fn overwrite_replaces_previous_messages() {
        let (_tmp, store) = store();
        store
            .overwrite_messages("w1", "c1234567", &[message("u1", "old")])
            .await
            .unwrap();
        let written = store
            .overwrite_messages("w1", "c1234567", &[message("u2", "new"), message("u3", "newer")])
            .await
            .unwrap();
        assert_eq!(written, 2);

        let result = store.read_messages("w1", "c1234567", None).await.unwrap();
        let uuids: Vec<_> = result.iter().map(|m| m.uuid.as_str()).collect();
        assert_eq!(uuids, ["u2", "u3"]);

        let tail = store.read_messages("w1", "c1234567", Some(1)).await.unwrap();
        assert_eq!(tail[0].uuid, "u3");
        assert_eq!(tail[0].contents[0].content, "newer");
    }

    #[tokio::test]
    async fn overwrite_leaves_no_temp_files_behind() {
        let (_tmp, store) = store();
        store
            .overwrite_messages("w1", "c1234567", &[message("u1", "a")])
            .await
            .unwrap();
        let dir = store.messages_path("w1", "c1234567").parent().unwrap().to_path_buf();
        let names: Vec<_> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, ["c1234567.messages.jsonl"]);
    }

    #[tokio::test]
    async fn delete_removes_files_and_empty_shard() {
        let (_tmp, store) = store();
        store
            .append_input("w1", "c1234567", &InputRecord::new(InputRole::User, "hello"))
            .await
            .unwrap();
        store
            .overwrite_messages("w1", "c1234567", &[message("u1", "hi")])
            .await
            .unwrap();
        assert!(store.conversation_exists("w1", "c1234567").await);

        assert!(store.delete_conversation("w1", "c1234567").await.unwrap());
        assert!(!store.conversation_exists("w1", "c1234567").await);
        assert!(!store.root().join("w1").join("c1").exists());
        assert!(store.read_inputs("w1", "c1234567", None).await.unwrap().is_empty());

        // Second delete is a no-op.
        assert!(!store.delete_conversation("w1", "c1234567").await.unwrap());
    }

    #[tokio::test]
    async fn delete_keeps_shard_shared_with_other_conversations() {
        let (_tmp, store) = store();
        for id in ["c1aaaa", "c1bbbb"] {
            store
                .append_input("w1", id, &InputRecord::new(InputRole::User, "x"))
                .await
                .unwrap();
        }
        store.delete_conversation("w1", "c1aaaa").await.unwrap();
        assert!(store.conversation_exists("w1", "c1bbbb").await);
    }

    #[tokio::test]
    async fn sync_lock_is_shared_per_conversation() {
        let (_tmp, store) = store();
        let a = store.sync_lock("c1");
        let b = store.sync_lock("c1");
        let other = store.sync_lock("c2");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &other));

        let _held = a.lock().await;
        assert!(b.try_lock().is_err());
        assert!(other.try_lock().is_ok());
    }
}
