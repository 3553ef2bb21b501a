//! Claude transcript files: where they live and how their records map to
//! [`NormalizedMessage`]s.
//!
//! The CLI writes one JSONL file per session under
//! `<claude_home>/projects/<sanitized cwd>/<session id>.jsonl`, where the
//! sanitized cwd is the absolute working directory with every character
//! outside `[A-Za-z0-9]` replaced by `-`.

use crate::error::{Error, Result};
use crate::message::{ContentBlock, MessageType, NormalizedMessage, TokenUsage};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{trace, warn};

const LOG_EXT: &str = "jsonl";

/// `/Users/me/my_proj` -> `-Users-me-my-proj`
pub fn sanitize_project_path(project_path: &Path) -> String {
    project_path
        .to_string_lossy()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

/// Root of every project's transcripts.
pub fn projects_dir(claude_home: &Path) -> PathBuf {
    claude_home.join("projects")
}

/// Derived location of a session's transcript.
pub fn session_log_path(projects_root: &Path, project_path: &Path, handle: &str) -> PathBuf {
    projects_root
        .join(sanitize_project_path(project_path))
        .join(format!("{handle}.{LOG_EXT}"))
}

/// Session handle a transcript path belongs to, if it looks like one.
pub fn handle_from_log_path(path: &Path) -> Option<&str> {
    let is_log = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case(LOG_EXT));
    if !is_log {
        return None;
    }
    path.file_stem().and_then(|s| s.to_str())
}

fn is_safe_handle(handle: &str) -> bool {
    !handle.is_empty()
        && handle != "."
        && handle != ".."
        && !handle.contains(['/', '\\'])
}

/// Find the transcript for `handle`: the derived path first, then any
/// project directory holding `<handle>.jsonl` (the CLI shortens very long
/// directory names, which breaks the plain mapping).
pub async fn locate_session_file(
    projects_root: &Path,
    project_path: &Path,
    handle: &str,
) -> Result<PathBuf> {
    if !is_safe_handle(handle) {
        return Err(Error::not_found(format!("session handle {handle:?}")));
    }

    let derived = session_log_path(projects_root, project_path, handle);
    if tokio::fs::try_exists(&derived).await.unwrap_or(false) {
        return Ok(derived);
    }

    let file_name = format!("{handle}.{LOG_EXT}");
    let mut entries = match tokio::fs::read_dir(projects_root).await {
        Ok(entries) => entries,
        Err(e) => return Err(Error::from_io_at(e, &derived)),
    };
    while let Some(entry) = entries.next_entry().await? {
        let candidate = entry.path().join(&file_name);
        if tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
            trace!(path = %candidate.display(), "transcript found by scan");
            return Ok(candidate);
        }
    }
    Err(Error::not_found(derived.display().to_string()))
}

/// Parse a whole transcript. Malformed lines are logged and skipped; records
/// sharing a uuid collapse to the last one, kept at the first one's position.
pub async fn load_transcript(path: &Path) -> Result<Vec<NormalizedMessage>> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| Error::from_io_at(e, path))?;
    let text = String::from_utf8_lossy(&bytes);
    Ok(parse_transcript(path, &text))
}

pub(crate) fn parse_transcript(path: &Path, text: &str) -> Vec<NormalizedMessage> {
    let mut out: Vec<NormalizedMessage> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();

    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let value: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                let skipped = Error::ParseSkipped {
                    path: path.to_path_buf(),
                    line: idx + 1,
                    message: e.to_string(),
                };
                warn!(error = %skipped, "skipping malformed transcript line");
                continue;
            }
        };
        let Some(message) = normalize_record(&value) else {
            trace!(path = %path.display(), line = idx + 1, "transcript record ignored");
            continue;
        };

        match positions.get(&message.uuid) {
            Some(&pos) => out[pos] = message,
            None => {
                positions.insert(message.uuid.clone(), out.len());
                out.push(message);
            }
        }
    }
    out
}

/// Map one raw transcript record. `None` for records that are not part of
/// the conversation or carry no uuid.
pub fn normalize_record(record: &Value) -> Option<NormalizedMessage> {
    let kind = MessageType::from_raw(record.get("type")?.as_str()?)?;
    let uuid = record
        .get("uuid")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())?
        .to_string();

    let timestamp = record
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    let parent_uuid = record
        .get("parentUuid")
        .and_then(Value::as_str)
        .map(ToString::to_string);

    let body = record.get("message");
    let mut contents = match kind {
        MessageType::User | MessageType::Assistant => {
            body.and_then(|m| m.get("content")).map(content_blocks).unwrap_or_default()
        }
        _ => Vec::new(),
    };

    let (model, usage) = match kind {
        MessageType::Assistant => (
            body.and_then(|m| m.get("model"))
                .and_then(Value::as_str)
                .map(ToString::to_string),
            body.and_then(|m| m.get("usage"))
                .and_then(|u| serde_json::from_value::<TokenUsage>(u.clone()).ok()),
        ),
        _ => (None, None),
    };

    let error = body
        .and_then(|m| m.get("error"))
        .or_else(|| record.get("error"))
        .and_then(error_text);
    if let Some(err) = &error {
        if contents.is_empty() {
            contents.push(ContentBlock::error(err.clone()));
        }
    }

    Some(NormalizedMessage {
        uuid,
        kind,
        contents,
        timestamp,
        parent_uuid,
        model,
        usage,
        error,
    })
}

fn content_blocks(content: &Value) -> Vec<ContentBlock> {
    match content {
        Value::String(s) => vec![ContentBlock::text(s.clone())],
        Value::Array(items) => items.iter().filter_map(content_block).collect(),
        _ => Vec::new(),
    }
}

fn content_block(item: &Value) -> Option<ContentBlock> {
    match item.get("type")?.as_str()? {
        "text" => Some(ContentBlock::text(
            item.get("text").and_then(Value::as_str).unwrap_or_default(),
        )),
        "tool_use" => {
            let name = item.get("name").and_then(Value::as_str).unwrap_or("unknown");
            let input = item.get("input").map(Value::to_string).unwrap_or_default();
            Some(ContentBlock::tool_use(name, input))
        }
        "tool_result" => {
            let tool_use_id = item
                .get("tool_use_id")
                .and_then(Value::as_str)
                .map(ToString::to_string);
            let content = item.get("content").map(flatten_text).unwrap_or_default();
            Some(ContentBlock::tool_result(content, tool_use_id))
        }
        // thinking, image, ...
        _ => None,
    }
}

/// Tool output is either a string or a list of text blocks.
fn flatten_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.as_str()),
                other => other.get("text").and_then(Value::as_str),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn error_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Object(obj) => obj
            .get("message")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .or_else(|| Some(value.to_string())),
        other => Some(other.to_string()),
    }
}
