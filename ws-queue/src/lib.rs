//! Job queue between the request path and the worker.
//!
//! Delivery is at-least-once: a received message stays owned by its receipt
//! until the consumer deletes it after processing.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryQueue;
pub use sqlite::{SqliteQueue, SqliteQueueConfig};

pub type Result<T> = std::result::Result<T, QueueError>;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Malformed job payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Queue error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Create,
    Start,
    Stop,
    Delete,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobKind::Create => "create",
            JobKind::Start => "start",
            JobKind::Stop => "stop",
            JobKind::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// Wire payload: `{"type": "create", "workspaceId": "<id>"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    #[serde(rename = "type")]
    pub kind: JobKind,
    pub workspace_id: String,
}

impl Job {
    pub fn new(kind: JobKind, workspace_id: impl Into<String>) -> Self {
        Self {
            kind,
            workspace_id: workspace_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedJob {
    pub job: Job,
    /// Opaque handle passed back to [`JobQueue::delete`].
    pub receipt: String,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn send(&self, job: &Job) -> Result<()>;

    /// Next available job, or `None` once the backend's wait elapses.
    async fn receive(&self) -> Result<Option<ReceivedJob>>;

    /// Acknowledge a processed job. Unknown receipts are not an error.
    async fn delete(&self, receipt: &str) -> Result<()>;
}
