//! agentsync: resumable conversations with CLI AI agents
//!
//! Conversations are started and resumed through the agent's own CLI; the
//! agent's session log is mirrored into a local record store, either on
//! demand or automatically whenever the log changes on disk.

pub mod agents;
pub mod config;
pub mod conversations;
pub mod error;
pub mod message;
pub mod registry;
pub mod service;
pub mod store;
pub mod tail;
pub mod watch;

pub use error::{Error, Result};
