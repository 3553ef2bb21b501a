//! Error taxonomy shared by every component.
//!
//! Per-record parse failures are absorbed where they happen (logged and
//! skipped); everything else is surfaced to the immediate caller.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Missing file, conversation, worker or session handle.
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation issued in the wrong lifecycle state (e.g. resume before start).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The agent binary failed while starting a fresh session.
    /// `message` carries the binary's captured output verbatim where available.
    #[error("session start failed: {message}")]
    SessionStartFailed { message: String },

    /// The agent binary failed while resuming an existing session.
    #[error("session continue failed: {message}")]
    SessionContinueFailed { message: String },

    /// A single malformed record. Only ever logged, never returned from a
    /// public operation.
    #[error("skipped record at {}:{line}: {message}", path.display())]
    ParseSkipped {
        path: PathBuf,
        line: usize,
        message: String,
    },

    /// The filesystem notification subscription could not be established.
    #[error("failed to watch {}: {source}", path.display())]
    WatchSetupFailed {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },

    /// Worker type without a working driver.
    #[error("unsupported worker type: {0}")]
    Unsupported(String),

    #[error("invalid worker name '{0}': must start with a letter, contain only alphanumerics, '-' or '_', and be 1-64 characters long")]
    InvalidWorkerName(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub(crate) fn invalid_state(what: impl Into<String>) -> Self {
        Self::InvalidState(what.into())
    }

    /// Map a missing-file IO error to [`Error::NotFound`], keep the rest as IO.
    pub(crate) fn from_io_at(err: std::io::Error, path: &std::path::Path) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound(path.display().to_string())
        } else {
            Self::Io(err)
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_maps_to_not_found() {
        let err = Error::from_io_at(
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
            std::path::Path::new("/tmp/x.jsonl"),
        );
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "not found: /tmp/x.jsonl");
    }

    #[test]
    fn other_io_errors_stay_io() {
        let err = Error::from_io_at(
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope"),
            std::path::Path::new("/tmp/x.jsonl"),
        );
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn start_failure_keeps_binary_output_verbatim() {
        let err = Error::SessionStartFailed {
            message: "Invalid API key · Please run /login".into(),
        };
        assert_eq!(
            err.to_string(),
            "session start failed: Invalid API key · Please run /login"
        );
    }
}
