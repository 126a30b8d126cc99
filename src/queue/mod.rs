//! Durable work queue over a stream primitive with consumer-group
//! semantics.
//!
//! Entries are delivered to exactly one consumer in the group and
//! stay in the pending set until acknowledged, so a crash between
//! processing and ack redelivers. Downstream writes are idempotent by
//! conversation id to absorb the resulting at-least-once delivery.

pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::Conversation;

pub use self::memory::MemoryQueue;
pub use self::redis::RedisStreamQueue;

/// One delivered stream entry.
///
/// The payload stays raw here: decoding happens in the worker so a
/// poison message can be logged and acked instead of wedging the
/// pending set.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    /// Stream-assigned, monotonically increasing id.
    pub stream_id: String,
    pub conversation_id: String,
    /// JSON-encoded conversation.
    pub payload: String,
}

/// The queue contract shared by the Redis stream and the in-memory
/// implementation.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Append one entry; returns only on durable commit.
    async fn publish(&self, conv: &Conversation) -> anyhow::Result<()>;

    /// Append many entries pipelined, atomically with respect to each
    /// other.
    async fn publish_batch(&self, convs: &[Conversation]) -> anyhow::Result<()>;

    /// Block up to `block` waiting for up to `max_count` new entries.
    /// A possibly-empty batch is returned on timeout.
    async fn consume(&self, max_count: usize, block: Duration)
        -> anyhow::Result<Vec<QueueEntry>>;

    /// Remove entries from the group's pending set.
    async fn ack(&self, stream_ids: &[String]) -> anyhow::Result<()>;

    /// Total entries in the stream.
    async fn len(&self) -> anyhow::Result<u64>;
}
