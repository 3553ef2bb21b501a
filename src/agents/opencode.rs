//! OpenCode driver placeholder. Every operation fails with `Unsupported`.

use super::{SessionDriver, SessionReply, WorkerKind};
use crate::error::{Error, Result};
use crate::message::{Conversation, NormalizedMessage, Worker};
use async_trait::async_trait;

#[derive(Debug, Default, Clone, Copy)]
pub struct OpenCodeDriver;

fn unsupported<T>(operation: &str) -> Result<T> {
    Err(Error::Unsupported(format!("opencode: {operation}")))
}

#[async_trait]
impl SessionDriver for OpenCodeDriver {
    fn kind(&self) -> WorkerKind {
        WorkerKind::OpenCode
    }

    async fn start(&self, _: &Worker, _: &Conversation, _: &str) -> Result<SessionReply> {
        unsupported("start")
    }

    async fn resume(&self, _: &Worker, _: &Conversation, _: &str) -> Result<SessionReply> {
        unsupported("resume")
    }

    async fn activate(&self, _: &Conversation) -> Result<()> {
        unsupported("activate")
    }

    async fn archive(&self, _: &str) -> Result<()> {
        unsupported("archive")
    }

    async fn sync_messages(&self, _: &Conversation) -> Result<Vec<NormalizedMessage>> {
        unsupported("sync")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn every_operation_is_unsupported() {
        let driver = OpenCodeDriver;
        let worker = Worker::new("oc", WorkerKind::OpenCode).unwrap();
        let conv = Conversation::new("oc", PathBuf::from("/tmp"), None);

        assert!(matches!(driver.start(&worker, &conv, "hi").await, Err(Error::Unsupported(_))));
        assert!(matches!(driver.resume(&worker, &conv, "hi").await, Err(Error::Unsupported(_))));
        assert!(matches!(driver.activate(&conv).await, Err(Error::Unsupported(_))));
        assert!(matches!(driver.archive("h").await, Err(Error::Unsupported(_))));
        assert!(matches!(driver.sync_messages(&conv).await, Err(Error::Unsupported(_))));
    }
}
