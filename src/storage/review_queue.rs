//! Human review queue store.
//!
//! Pending items are served priority-first (1 is most urgent), oldest
//! first within a priority. Insertion is best-effort from the
//! worker's point of view; consumers dedupe redelivered items as
//! needed.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use crate::domain::{ReviewQueueItem, ReviewStatus};

use super::{open, parse_rfc3339, to_rfc3339};

pub struct ReviewQueueStore {
    db_path: PathBuf,
}

impl ReviewQueueStore {
    pub fn new(db_path: &Path) -> anyhow::Result<Self> {
        let conn = open(db_path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS human_review_queue (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                evaluation_id TEXT,
                reason TEXT NOT NULL,
                priority INTEGER NOT NULL,
                status TEXT NOT NULL,
                assigned_to TEXT,
                routing_confidence REAL NOT NULL DEFAULT 0.0,
                created_at TEXT NOT NULL,
                reviewed_at TEXT,
                reviewer_notes TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_review_queue_status
                ON human_review_queue(status, priority, created_at);",
        )?;

        Ok(Self {
            db_path: db_path.to_path_buf(),
        })
    }

    pub fn add(&self, item: &ReviewQueueItem) -> anyhow::Result<()> {
        let id = if item.id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            item.id.clone()
        };

        let conn = open(&self.db_path)?;
        conn.execute(
            "INSERT INTO human_review_queue (
                id, conversation_id, evaluation_id, reason, priority,
                status, assigned_to, routing_confidence, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                id,
                item.conversation_id,
                item.evaluation_id,
                item.reason,
                item.priority,
                item.status.as_str(),
                item.assigned_to,
                item.routing_confidence,
                to_rfc3339(item.created_at),
            ],
        )
        .context("insert review queue item")?;

        Ok(())
    }

    /// Pending items, most urgent first, oldest first within a
    /// priority.
    pub fn pending(&self, limit: usize, offset: usize) -> anyhow::Result<Vec<ReviewQueueItem>> {
        let limit = if limit == 0 || limit > 100 { 50 } else { limit };

        let conn = open(&self.db_path)?;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, evaluation_id, reason, priority,
                    status, assigned_to, routing_confidence, created_at, reviewed_at, reviewer_notes
             FROM human_review_queue
             WHERE status = 'pending'
             ORDER BY priority ASC, created_at ASC
             LIMIT ?1 OFFSET ?2",
        )?;

        let rows = stmt
            .query_map(params![limit as i64, offset as i64], scan_item)
            .context("query pending reviews")?;

        let mut items = Vec::new();
        for row in rows {
            items.push(decode(row?)?);
        }
        Ok(items)
    }

    pub fn count_pending(&self) -> anyhow::Result<u64> {
        let conn = open(&self.db_path)?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM human_review_queue WHERE status = 'pending'",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn get(&self, id: &str) -> anyhow::Result<Option<ReviewQueueItem>> {
        let conn = open(&self.db_path)?;
        let row = conn
            .query_row(
                "SELECT id, conversation_id, evaluation_id, reason, priority,
                        status, assigned_to, routing_confidence, created_at, reviewed_at, reviewer_notes
                 FROM human_review_queue WHERE id = ?1",
                params![id],
                scan_item,
            )
            .optional()
            .context("query review queue item")?;

        row.map(decode).transpose()
    }

    /// Claim a pending item for a reviewer.
    pub fn assign(&self, id: &str, assigned_to: &str) -> anyhow::Result<()> {
        let conn = open(&self.db_path)?;
        conn.execute(
            "UPDATE human_review_queue
             SET status = 'in_progress', assigned_to = ?1
             WHERE id = ?2 AND status = 'pending'",
            params![assigned_to, id],
        )
        .context("assign review")?;
        Ok(())
    }

    pub fn complete(&self, id: &str, reviewer_notes: &str) -> anyhow::Result<()> {
        let conn = open(&self.db_path)?;
        conn.execute(
            "UPDATE human_review_queue
             SET status = 'completed', reviewed_at = ?1, reviewer_notes = ?2
             WHERE id = ?3",
            params![to_rfc3339(Utc::now()), reviewer_notes, id],
        )
        .context("complete review")?;
        Ok(())
    }
}

struct RawItem {
    id: String,
    conversation_id: String,
    evaluation_id: Option<String>,
    reason: String,
    priority: i32,
    status: String,
    assigned_to: Option<String>,
    routing_confidence: f64,
    created_at: String,
    reviewed_at: Option<String>,
    reviewer_notes: Option<String>,
}

fn scan_item(row: &Row<'_>) -> rusqlite::Result<RawItem> {
    Ok(RawItem {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        evaluation_id: row.get(2)?,
        reason: row.get(3)?,
        priority: row.get(4)?,
        status: row.get(5)?,
        assigned_to: row.get(6)?,
        routing_confidence: row.get(7)?,
        created_at: row.get(8)?,
        reviewed_at: row.get(9)?,
        reviewer_notes: row.get(10)?,
    })
}

fn decode(raw: RawItem) -> anyhow::Result<ReviewQueueItem> {
    Ok(ReviewQueueItem {
        id: raw.id,
        conversation_id: raw.conversation_id,
        evaluation_id: raw.evaluation_id,
        reason: raw.reason,
        priority: raw.priority,
        status: raw.status.parse::<ReviewStatus>()?,
        assigned_to: raw.assigned_to,
        routing_confidence: raw.routing_confidence,
        created_at: parse_rfc3339(&raw.created_at)?,
        reviewed_at: raw.reviewed_at.as_deref().map(parse_rfc3339).transpose()?,
        reviewer_notes: raw.reviewer_notes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    fn store() -> (TempDir, ReviewQueueStore) {
        let tmp = TempDir::new().unwrap();
        let store = ReviewQueueStore::new(&tmp.path().join("test.db")).unwrap();
        (tmp, store)
    }

    fn item(conversation_id: &str, reason: &str, priority: i32) -> ReviewQueueItem {
        ReviewQueueItem {
            id: String::new(),
            conversation_id: conversation_id.into(),
            evaluation_id: None,
            reason: reason.into(),
            priority,
            status: ReviewStatus::Pending,
            assigned_to: None,
            routing_confidence: 0.5,
            created_at: Utc::now(),
            reviewed_at: None,
            reviewer_notes: None,
        }
    }

    #[test]
    fn pending_orders_by_priority_then_age() {
        let (_tmp, store) = store();

        let mut old_low = item("c-old-low", "quality_review", 3);
        old_low.created_at = Utc::now() - Duration::hours(2);
        let mut old_high = item("c-old-high", "evaluation_failed", 1);
        old_high.created_at = Utc::now() - Duration::hours(1);
        let new_high = item("c-new-high", "evaluation_failed", 1);

        store.add(&old_low).unwrap();
        store.add(&new_high).unwrap();
        store.add(&old_high).unwrap();

        let pending = store.pending(10, 0).unwrap();
        let order: Vec<&str> = pending.iter().map(|i| i.conversation_id.as_str()).collect();
        assert_eq!(order, vec!["c-old-high", "c-new-high", "c-old-low"]);
    }

    #[test]
    fn count_tracks_pending_only() {
        let (_tmp, store) = store();
        store.add(&item("c1", "low_confidence", 2)).unwrap();
        store.add(&item("c2", "low_quality_score", 2)).unwrap();
        assert_eq!(store.count_pending().unwrap(), 2);

        let pending = store.pending(10, 0).unwrap();
        store.complete(&pending[0].id, "looks fine actually").unwrap();
        assert_eq!(store.count_pending().unwrap(), 1);
    }

    #[test]
    fn assign_moves_pending_to_in_progress() {
        let (_tmp, store) = store();
        store.add(&item("c1", "low_confidence", 2)).unwrap();

        let pending = store.pending(10, 0).unwrap();
        store.assign(&pending[0].id, "reviewer-7").unwrap();

        let loaded = store.get(&pending[0].id).unwrap().unwrap();
        assert_eq!(loaded.status, ReviewStatus::InProgress);
        assert_eq!(loaded.assigned_to.as_deref(), Some("reviewer-7"));
        assert!(store.pending(10, 0).unwrap().is_empty());
    }

    #[test]
    fn complete_sets_notes_and_timestamp() {
        let (_tmp, store) = store();
        store.add(&item("c1", "evaluation_failed", 1)).unwrap();

        let pending = store.pending(10, 0).unwrap();
        store.complete(&pending[0].id, "confirmed regression").unwrap();

        let loaded = store.get(&pending[0].id).unwrap().unwrap();
        assert_eq!(loaded.status, ReviewStatus::Completed);
        assert!(loaded.reviewed_at.is_some());
        assert_eq!(loaded.reviewer_notes.as_deref(), Some("confirmed regression"));
    }

    #[test]
    fn missing_item_is_none() {
        let (_tmp, store) = store();
        assert!(store.get("nope").unwrap().is_none());
    }

    #[test]
    fn duplicate_reviews_for_same_conversation_are_allowed() {
        let (_tmp, store) = store();
        store.add(&item("c1", "low_quality_score", 2)).unwrap();
        store.add(&item("c1", "low_quality_score", 2)).unwrap();
        assert_eq!(store.count_pending().unwrap(), 2);
    }
}
