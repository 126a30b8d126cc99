//! Redis-stream queue: XADD / XREADGROUP / XACK under a named
//! consumer group.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;

use crate::domain::Conversation;

use super::{Queue, QueueEntry};

pub struct RedisStreamQueue {
    conn: MultiplexedConnection,
    stream: String,
    group: String,
    consumer: String,
}

impl RedisStreamQueue {
    /// Connect and idempotently create the consumer group (a group
    /// that already exists is fine).
    pub async fn connect(
        url: &str,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> anyhow::Result<Self> {
        let client = redis::Client::open(url).context("redis url")?;
        let mut conn = client
            .get_multiplexed_tokio_connection()
            .await
            .context("redis connect")?;

        let created: redis::RedisResult<()> =
            conn.xgroup_create_mkstream(stream, group, "0").await;
        if let Err(e) = created {
            if !e.to_string().contains("BUSYGROUP") {
                return Err(anyhow::Error::new(e).context("create consumer group"));
            }
        }

        Ok(Self {
            conn,
            stream: stream.to_string(),
            group: group.to_string(),
            consumer: consumer.to_string(),
        })
    }

    fn encode(conv: &Conversation) -> anyhow::Result<String> {
        serde_json::to_string(conv).with_context(|| format!("marshal conversation {}", conv.id))
    }
}

#[async_trait]
impl Queue for RedisStreamQueue {
    async fn publish(&self, conv: &Conversation) -> anyhow::Result<()> {
        let payload = Self::encode(conv)?;
        let mut conn = self.conn.clone();
        let _: String = conn
            .xadd(
                &self.stream,
                "*",
                &[("conversation_id", conv.id.as_str()), ("data", &payload)],
            )
            .await
            .context("xadd")?;
        Ok(())
    }

    async fn publish_batch(&self, convs: &[Conversation]) -> anyhow::Result<()> {
        if convs.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        for conv in convs {
            let payload = Self::encode(conv)?;
            pipe.xadd(
                &self.stream,
                "*",
                &[("conversation_id", conv.id.as_str()), ("data", &payload)],
            );
        }

        let mut conn = self.conn.clone();
        let _: Vec<String> = pipe.query_async(&mut conn).await.context("pipeline exec")?;
        Ok(())
    }

    async fn consume(
        &self,
        max_count: usize,
        block: Duration,
    ) -> anyhow::Result<Vec<QueueEntry>> {
        let options = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(max_count)
            .block(block.as_millis() as usize);

        let mut conn = self.conn.clone();
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&self.stream], &[">"], &options)
            .await
            .context("xreadgroup")?;

        let Some(reply) = reply else {
            return Ok(Vec::new());
        };

        let mut entries = Vec::new();
        for key in reply.keys {
            for id in key.ids {
                let Some(payload) = id.get::<String>("data") else {
                    // Malformed entry: nothing to process, but it must
                    // not linger in the pending set.
                    tracing::warn!(stream_id = %id.id, "stream entry without data field, acking");
                    self.ack(std::slice::from_ref(&id.id)).await?;
                    continue;
                };
                let conversation_id = id.get::<String>("conversation_id").unwrap_or_default();

                entries.push(QueueEntry {
                    stream_id: id.id.clone(),
                    conversation_id,
                    payload,
                });
            }
        }

        Ok(entries)
    }

    async fn ack(&self, stream_ids: &[String]) -> anyhow::Result<()> {
        if stream_ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .xack(&self.stream, &self.group, stream_ids)
            .await
            .context("xack")?;
        Ok(())
    }

    async fn len(&self) -> anyhow::Result<u64> {
        let mut conn = self.conn.clone();
        let len: u64 = conn.xlen(&self.stream).await.context("xlen")?;
        Ok(len)
    }
}
