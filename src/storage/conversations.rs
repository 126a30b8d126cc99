//! Conversation store: upsert by id, lookup, processed-stamp.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use crate::domain::{Conversation, Feedback, Turn};

use super::{open, parse_rfc3339, to_rfc3339};

pub struct ConversationStore {
    db_path: PathBuf,
}

impl ConversationStore {
    pub fn new(db_path: &Path) -> anyhow::Result<Self> {
        let conn = open(db_path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                agent_version TEXT NOT NULL,
                turns TEXT NOT NULL,
                feedback TEXT,
                metadata TEXT,
                created_at TEXT NOT NULL,
                processed_at TEXT,
                status TEXT
            );",
        )?;

        Ok(Self {
            db_path: db_path.to_path_buf(),
        })
    }

    /// Insert or update by id. Feedback is only overwritten when the
    /// incoming conversation carries some, so re-ingesting a
    /// transcript never erases attached annotations.
    pub fn upsert(&self, conv: &Conversation) -> anyhow::Result<()> {
        let conn = open(&self.db_path)?;
        self.upsert_with(&conn, conv)
    }

    /// Upsert many conversations in one transaction.
    pub fn upsert_batch(&self, convs: &[Conversation]) -> anyhow::Result<()> {
        let mut conn = open(&self.db_path)?;
        let tx = conn.transaction()?;
        for conv in convs {
            self.upsert_with(&tx, conv)?;
        }
        tx.commit().context("commit conversation batch")?;
        Ok(())
    }

    fn upsert_with(&self, conn: &rusqlite::Connection, conv: &Conversation) -> anyhow::Result<()> {
        let turns = serde_json::to_string(&conv.turns).context("marshal turns")?;
        let feedback = conv
            .feedback
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("marshal feedback")?;
        let metadata = conv
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("marshal metadata")?;
        let created_at = to_rfc3339(conv.created_at.unwrap_or_else(Utc::now));

        conn.execute(
            "INSERT INTO conversations (id, agent_version, turns, feedback, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                agent_version = excluded.agent_version,
                turns = excluded.turns,
                feedback = COALESCE(excluded.feedback, conversations.feedback),
                metadata = excluded.metadata",
            params![conv.id, conv.agent_version, turns, feedback, metadata, created_at],
        )
        .with_context(|| format!("upsert conversation {}", conv.id))?;

        Ok(())
    }

    pub fn get(&self, id: &str) -> anyhow::Result<Option<Conversation>> {
        let conn = open(&self.db_path)?;

        let row = conn
            .query_row(
                "SELECT id, agent_version, turns, feedback, metadata, created_at, processed_at
                 FROM conversations WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, Option<String>>(6)?,
                    ))
                },
            )
            .optional()
            .context("query conversation")?;

        let Some((id, agent_version, turns, feedback, metadata, created_at, processed_at)) = row
        else {
            return Ok(None);
        };

        let turns: Vec<Turn> = serde_json::from_str(&turns).context("unmarshal turns")?;
        let feedback: Option<Feedback> = feedback
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .context("unmarshal feedback")?;
        let metadata: Option<serde_json::Value> = metadata
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .context("unmarshal metadata")?;

        Ok(Some(Conversation {
            id,
            agent_version,
            turns,
            feedback,
            metadata,
            created_at: Some(parse_rfc3339(&created_at)?),
            processed_at: processed_at.as_deref().map(parse_rfc3339).transpose()?,
        }))
    }

    /// Stamp a conversation processed with its rollup status.
    pub fn mark_processed(&self, id: &str, status: &str) -> anyhow::Result<()> {
        let conn = open(&self.db_path)?;
        conn.execute(
            "UPDATE conversations SET processed_at = ?1, status = ?2 WHERE id = ?3",
            params![to_rfc3339(Utc::now()), status, id],
        )
        .with_context(|| format!("mark conversation {id} processed"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Annotation, ToolCall};
    use tempfile::TempDir;

    fn store() -> (TempDir, ConversationStore) {
        let tmp = TempDir::new().unwrap();
        let store = ConversationStore::new(&tmp.path().join("test.db")).unwrap();
        (tmp, store)
    }

    fn conv(id: &str) -> Conversation {
        Conversation {
            id: id.into(),
            agent_version: "v1".into(),
            turns: vec![Turn {
                turn_id: 1,
                role: "user".into(),
                content: "hello".into(),
                tool_calls: vec![ToolCall {
                    tool_name: "search".into(),
                    parameters: serde_json::json!({"q": "x"}),
                    result: None,
                    latency_ms: 10,
                }],
                timestamp: None,
            }],
            feedback: None,
            metadata: Some(serde_json::json!({"channel": "web"})),
            created_at: None,
            processed_at: None,
        }
    }

    #[test]
    fn upsert_then_get_round_trips() {
        let (_tmp, store) = store();
        store.upsert(&conv("c1")).unwrap();

        let loaded = store.get("c1").unwrap().unwrap();
        assert_eq!(loaded.id, "c1");
        assert_eq!(loaded.turns.len(), 1);
        assert_eq!(loaded.turns[0].tool_calls[0].tool_name, "search");
        assert!(loaded.created_at.is_some());
        assert!(loaded.processed_at.is_none());
    }

    #[test]
    fn missing_conversation_is_none() {
        let (_tmp, store) = store();
        assert!(store.get("nope").unwrap().is_none());
    }

    #[test]
    fn upsert_twice_is_idempotent() {
        let (_tmp, store) = store();
        store.upsert(&conv("c1")).unwrap();

        let mut updated = conv("c1");
        updated.agent_version = "v2".into();
        store.upsert(&updated).unwrap();

        let loaded = store.get("c1").unwrap().unwrap();
        assert_eq!(loaded.agent_version, "v2");
    }

    #[test]
    fn upsert_without_feedback_preserves_existing() {
        let (_tmp, store) = store();

        let mut with_feedback = conv("c1");
        with_feedback.feedback = Some(Feedback {
            user_rating: Some(4),
            ops_review: None,
            annotations: vec![Annotation {
                id: "a1".into(),
                conversation_id: "c1".into(),
                turn_id: None,
                annotator_id: "ann-1".into(),
                annotation_type: "quality".into(),
                label: "good".into(),
                confidence: 0.9,
                metadata: None,
                created_at: None,
            }],
        });
        store.upsert(&with_feedback).unwrap();

        // Redelivery carries no feedback; the stored one must survive.
        store.upsert(&conv("c1")).unwrap();

        let loaded = store.get("c1").unwrap().unwrap();
        let feedback = loaded.feedback.expect("feedback preserved");
        assert_eq!(feedback.user_rating, Some(4));
        assert_eq!(feedback.annotations.len(), 1);
    }

    #[test]
    fn batch_upsert_stores_all() {
        let (_tmp, store) = store();
        store
            .upsert_batch(&[conv("a"), conv("b"), conv("c")])
            .unwrap();
        assert!(store.get("a").unwrap().is_some());
        assert!(store.get("b").unwrap().is_some());
        assert!(store.get("c").unwrap().is_some());
    }

    #[test]
    fn mark_processed_sets_stamp() {
        let (_tmp, store) = store();
        store.upsert(&conv("c1")).unwrap();
        store.mark_processed("c1", "success").unwrap();

        let loaded = store.get("c1").unwrap().unwrap();
        assert!(loaded.processed_at.is_some());
    }
}
