//! Seams to the outside world: where jobs are sent and how bytes reach a
//! socket connection.

pub mod memory;

use std::time::Duration;

use {async_trait::async_trait, bytes::Bytes};

use switchyard_manifest::QueueDefinition;

pub use memory::{ChannelSink, MemoryQueue};

/// A job on its way to a queue.
#[derive(Debug, Clone)]
pub struct OutboundJob {
    pub job_id: String,
    pub body: Bytes,
    pub content_type: String,
    /// Ordering group. Always set for FIFO queues.
    pub group_id: Option<String>,
    /// Always set for FIFO queues.
    pub deduplication_id: Option<String>,
    pub delay: Option<Duration>,
}

#[async_trait]
pub trait QueueTransport: Send + Sync {
    async fn send(&self, queue: &QueueDefinition, job: OutboundJob) -> anyhow::Result<()>;

    /// Remove a processed message, identified by the receipt it was
    /// delivered with.
    async fn acknowledge(&self, queue: &str, receipt: &str) -> anyhow::Result<()>;
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// The connection no longer exists on the transport.
    #[error("connection {0} is gone")]
    Gone(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[async_trait]
pub trait ConnectionSink: Send + Sync {
    async fn send(&self, connection_id: &str, payload: Bytes) -> Result<(), SinkError>;

    async fn close(&self, connection_id: &str) -> Result<(), SinkError>;
}
