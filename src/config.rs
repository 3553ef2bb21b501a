//! Configuration (`config.json` in the platform config directory).
//!
//! On Linux this resolves to `~/.config/agentsync/config.json`, on macOS to
//! `~/Library/Application Support/agentsync/config.json`. A missing or invalid
//! file yields the defaults.

use crate::agents::WorkerKind;
use crate::error::{Error, Result};
use crate::message::{Worker, validate_worker_name};
use crate::tail::DEFAULT_BLOCK_SIZE;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

const APP_DIR: &str = "agentsync";
const CONFIG_FILE: &str = "config.json";
const DEFAULT_WORKER: &str = "claude";

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Root of the record store and the conversation index.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Claude CLI executable, looked up on `PATH` when not absolute.
    #[serde(default = "default_claude_binary")]
    pub claude_binary: PathBuf,
    /// Claude's home; transcripts live under `<claude_home>/projects`.
    #[serde(default = "default_claude_home")]
    pub claude_home: PathBuf,
    /// Block size for tail reads of record files.
    #[serde(default = "default_read_block_size")]
    pub read_block_size: usize,
    #[serde(default)]
    pub workers: Vec<Worker>,
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

fn default_claude_binary() -> PathBuf {
    PathBuf::from("claude")
}

fn default_claude_home() -> PathBuf {
    if let Some(home) = std::env::var_os("CLAUDE_CONFIG_DIR") {
        return PathBuf::from(home);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".claude")
}

fn default_read_block_size() -> usize {
    DEFAULT_BLOCK_SIZE
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            claude_binary: default_claude_binary(),
            claude_home: default_claude_home(),
            read_block_size: default_read_block_size(),
            workers: Vec::new(),
        }
    }
}

impl Config {
    /// Configured workers, or a single `claude` worker when none are set.
    pub fn workers(&self) -> Vec<Worker> {
        if !self.workers.is_empty() {
            return self.workers.clone();
        }
        Worker::new(DEFAULT_WORKER, WorkerKind::Claude)
            .map(|w| vec![w])
            .unwrap_or_default()
    }

    pub fn worker(&self, name: &str) -> Result<Worker> {
        self.workers()
            .into_iter()
            .find(|w| w.name == name)
            .ok_or_else(|| Error::not_found(format!("worker {name}")))
    }
}

// ---------------------------------------------------------------------------
// Directory helpers
// ---------------------------------------------------------------------------

/// Default config file location.
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join(APP_DIR).join(CONFIG_FILE))
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load config from the default location, returning defaults if the file is
/// missing or invalid.
pub fn load_config() -> Config {
    match config_path() {
        Some(path) => load_config_from(&path),
        None => Config::default(),
    }
}

/// Load config from `path`. Workers with invalid names are dropped.
pub fn load_config_from(path: &Path) -> Config {
    let mut config = match std::fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "invalid config, using defaults");
            Config::default()
        }),
        Err(_) => Config::default(),
    };

    config.workers.retain(|w| match validate_worker_name(&w.name) {
        Ok(()) => true,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring worker");
            false
        }
    });
    config.read_block_size = config.read_block_size.max(1);
    config
}

/// Save config to the default location.
pub fn save_config(config: &Config) -> Result<PathBuf> {
    let path = config_path().ok_or_else(|| Error::not_found("config dir"))?;
    save_config_to(config, &path)?;
    Ok(path)
}

pub fn save_config_to(config: &Config, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config)?;
    crate::store::atomic_write(path, json.as_bytes())?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn config_default_values() {
        let config = Config::default();
        assert_eq!(config.claude_binary, PathBuf::from("claude"));
        assert_eq!(config.read_block_size, 8192);
        assert!(config.data_dir.ends_with("agentsync"));
        assert!(config.workers.is_empty());
    }

    #[test]
    fn default_worker_is_claude() {
        let config = Config::default();
        let worker = config.worker("claude").unwrap();
        assert_eq!(worker.kind, WorkerKind::Claude);
        assert!(config.worker("other").unwrap_err().is_not_found());
    }

    #[test]
    fn config_save_load_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("config.json");

        let mut worker = Worker::new("fast", WorkerKind::Claude).unwrap();
        worker.command_params = vec!["--model".into(), "haiku".into()];
        let config = Config {
            data_dir: tmp.path().join("data"),
            claude_binary: PathBuf::from("/opt/claude/bin/claude"),
            claude_home: tmp.path().join(".claude"),
            read_block_size: 4096,
            workers: vec![worker],
        };
        save_config_to(&config, &path).unwrap();
        assert_eq!(load_config_from(&path), config);
    }

    #[test]
    fn load_missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_config_from(&tmp.path().join("config.json"));
        assert_eq!(config.read_block_size, 8192);
    }

    #[test]
    fn load_invalid_json_returns_default() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        fs::write(&path, "not valid json!!!").unwrap();
        assert_eq!(load_config_from(&path).claude_binary, PathBuf::from("claude"));
    }

    #[test]
    fn partial_config_fills_defaults_and_drops_bad_workers() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        fs::write(
            &path,
            r#"{
                "claude_binary": "/usr/local/bin/claude",
                "read_block_size": 0,
                "unknown_field": 42,
                "workers": [
                    {"name": "cc", "type": "claudecode", "env_vars": {"A": "1"}},
                    {"name": "1bad", "type": "claude"},
                    {"name": "oc", "type": "opencode"}
                ]
            }"#,
        )
        .unwrap();

        let config = load_config_from(&path);
        assert_eq!(config.claude_binary, PathBuf::from("/usr/local/bin/claude"));
        assert_eq!(config.read_block_size, 1);
        let names: Vec<_> = config.workers.iter().map(|w| w.name.as_str()).collect();
        assert_eq!(names, ["cc", "oc"]);
        assert_eq!(config.workers[0].kind, WorkerKind::Claude);
        assert_eq!(config.workers[0].env_vars["A"], "1");
        assert_eq!(config.workers[1].kind, WorkerKind::OpenCode);
    }
}
