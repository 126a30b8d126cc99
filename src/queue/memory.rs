//! In-process queue with the same delivery/ack contract as the Redis
//! stream: each entry goes to one consumer and stays pending until
//! acknowledged. Backs the async tests and single-process development
//! runs.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use crate::domain::Conversation;

use super::{Queue, QueueEntry};

#[derive(Default)]
struct Inner {
    next_seq: u64,
    /// Entries not yet delivered to any consumer.
    ready: VecDeque<QueueEntry>,
    /// Delivered but unacknowledged entries, keyed by stream id.
    pending: HashMap<String, QueueEntry>,
}

#[derive(Default)]
pub struct MemoryQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move every unacknowledged entry back to the ready set, as a
    /// consumer-crash redelivery would.
    pub async fn reclaim(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let mut reclaimed: Vec<QueueEntry> = inner.pending.drain().map(|(_, e)| e).collect();
        reclaimed.sort_by(|a, b| a.stream_id.cmp(&b.stream_id));
        let count = reclaimed.len();
        for entry in reclaimed.into_iter().rev() {
            inner.ready.push_front(entry);
        }
        if count > 0 {
            self.notify.notify_one();
        }
        count
    }

    /// Number of delivered-but-unacknowledged entries.
    pub async fn pending_len(&self) -> usize {
        self.inner.lock().await.pending.len()
    }

    async fn append(&self, conv: &Conversation) -> anyhow::Result<()> {
        let payload = serde_json::to_string(conv)
            .with_context(|| format!("marshal conversation {}", conv.id))?;

        let mut inner = self.inner.lock().await;
        inner.next_seq += 1;
        // Zero-padded so lexicographic order matches append order.
        let entry = QueueEntry {
            stream_id: format!("{:016}-0", inner.next_seq),
            conversation_id: conv.id.clone(),
            payload,
        };
        inner.ready.push_back(entry);
        drop(inner);

        self.notify.notify_one();
        Ok(())
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn publish(&self, conv: &Conversation) -> anyhow::Result<()> {
        self.append(conv).await
    }

    async fn publish_batch(&self, convs: &[Conversation]) -> anyhow::Result<()> {
        for conv in convs {
            self.append(conv).await?;
        }
        Ok(())
    }

    async fn consume(
        &self,
        max_count: usize,
        block: Duration,
    ) -> anyhow::Result<Vec<QueueEntry>> {
        let deadline = tokio::time::Instant::now() + block;

        loop {
            {
                let mut inner = self.inner.lock().await;
                if !inner.ready.is_empty() {
                    let take = max_count.min(inner.ready.len());
                    let mut batch = Vec::with_capacity(take);
                    for _ in 0..take {
                        if let Some(entry) = inner.ready.pop_front() {
                            inner.pending.insert(entry.stream_id.clone(), entry.clone());
                            batch.push(entry);
                        }
                    }
                    return Ok(batch);
                }
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(Vec::new()),
            }
        }
    }

    async fn ack(&self, stream_ids: &[String]) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        for id in stream_ids {
            inner.pending.remove(id);
        }
        Ok(())
    }

    async fn len(&self) -> anyhow::Result<u64> {
        let inner = self.inner.lock().await;
        Ok((inner.ready.len() + inner.pending.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conv(id: &str) -> Conversation {
        Conversation {
            id: id.into(),
            agent_version: "v1".into(),
            turns: vec![],
            feedback: None,
            metadata: None,
            created_at: None,
            processed_at: None,
        }
    }

    #[tokio::test]
    async fn delivers_each_entry_once_until_ack() {
        let queue = MemoryQueue::new();
        queue.publish(&conv("a")).await.unwrap();
        queue.publish(&conv("b")).await.unwrap();

        let first = queue.consume(10, Duration::from_millis(10)).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].conversation_id, "a");

        // Same entries are pending, not redelivered.
        let second = queue.consume(10, Duration::from_millis(10)).await.unwrap();
        assert!(second.is_empty());
        assert_eq!(queue.pending_len().await, 2);
    }

    #[tokio::test]
    async fn ack_removes_from_pending() {
        let queue = MemoryQueue::new();
        queue.publish(&conv("a")).await.unwrap();

        let batch = queue.consume(1, Duration::from_millis(10)).await.unwrap();
        let ids: Vec<String> = batch.iter().map(|e| e.stream_id.clone()).collect();
        queue.ack(&ids).await.unwrap();

        assert_eq!(queue.pending_len().await, 0);
        assert_eq!(queue.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reclaim_redelivers_unacked_entries() {
        let queue = MemoryQueue::new();
        queue.publish(&conv("a")).await.unwrap();

        let first = queue.consume(1, Duration::from_millis(10)).await.unwrap();
        assert_eq!(first.len(), 1);

        assert_eq!(queue.reclaim().await, 1);

        let second = queue.consume(1, Duration::from_millis(10)).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].conversation_id, "a");
        assert_eq!(second[0].stream_id, first[0].stream_id);
    }

    #[tokio::test]
    async fn consume_respects_max_count() {
        let queue = MemoryQueue::new();
        queue
            .publish_batch(&[conv("a"), conv("b"), conv("c")])
            .await
            .unwrap();

        let batch = queue.consume(2, Duration::from_millis(10)).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(queue.len().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn blocking_consume_wakes_on_publish() {
        let queue = std::sync::Arc::new(MemoryQueue::new());

        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.consume(1, Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.publish(&conv("late")).await.unwrap();

        let batch = consumer.await.unwrap().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].conversation_id, "late");
    }

    #[tokio::test]
    async fn consume_times_out_empty() {
        let queue = MemoryQueue::new();
        let batch = queue.consume(1, Duration::from_millis(20)).await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn stream_ids_are_monotonic() {
        let queue = MemoryQueue::new();
        for i in 0..5 {
            queue.publish(&conv(&format!("c{i}"))).await.unwrap();
        }
        let batch = queue.consume(10, Duration::from_millis(10)).await.unwrap();
        let ids: Vec<&String> = batch.iter().map(|e| &e.stream_id).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }
}
