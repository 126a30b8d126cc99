//! Evaluation store: plain inserts (each attempt gets its own row),
//! batch insert in one transaction, lookup by conversation.

use std::path::{Path, PathBuf};

use anyhow::Context;
use rusqlite::{params, Row};
use uuid::Uuid;

use crate::domain::{EvalStatus, Evaluation, EvaluatorType, Issue, Scores};

use super::{open, parse_rfc3339, to_rfc3339};

pub struct EvaluationStore {
    db_path: PathBuf,
}

impl EvaluationStore {
    pub fn new(db_path: &Path) -> anyhow::Result<Self> {
        let conn = open(db_path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS evaluations (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                evaluator_type TEXT NOT NULL,
                status TEXT NOT NULL,
                model_name TEXT,
                prompt_tokens INTEGER NOT NULL DEFAULT 0,
                completion_tokens INTEGER NOT NULL DEFAULT 0,
                total_tokens INTEGER NOT NULL DEFAULT 0,
                estimated_cost_usd REAL NOT NULL DEFAULT 0.0,
                error_message TEXT,
                scores TEXT NOT NULL,
                issues TEXT,
                confidence REAL NOT NULL DEFAULT 0.0,
                raw_output TEXT,
                latency_ms INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_evaluations_conversation
                ON evaluations(conversation_id);",
        )?;

        Ok(Self {
            db_path: db_path.to_path_buf(),
        })
    }

    pub fn insert(&self, eval: &Evaluation) -> anyhow::Result<()> {
        let conn = open(&self.db_path)?;
        insert_with(&conn, eval)
    }

    /// Insert the whole batch of one attempt atomically: either every
    /// per-evaluator record lands, or the job is redelivered.
    pub fn insert_batch(&self, evals: &[Evaluation]) -> anyhow::Result<()> {
        let mut conn = open(&self.db_path)?;
        let tx = conn.transaction()?;
        for eval in evals {
            insert_with(&tx, eval)?;
        }
        tx.commit().context("commit evaluation batch")?;
        Ok(())
    }

    pub fn get_by_conversation(&self, conversation_id: &str) -> anyhow::Result<Vec<Evaluation>> {
        let conn = open(&self.db_path)?;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, evaluator_type, status, model_name,
                    prompt_tokens, completion_tokens, total_tokens, estimated_cost_usd,
                    error_message, scores, issues, confidence, raw_output, latency_ms, created_at
             FROM evaluations
             WHERE conversation_id = ?1
             ORDER BY created_at DESC, id",
        )?;

        let rows = stmt
            .query_map(params![conversation_id], RawRow::scan)
            .context("query evaluations")?;

        let mut evals = Vec::new();
        for row in rows {
            evals.push(row?.decode()?);
        }
        Ok(evals)
    }
}

/// Row as stored, before the enum and JSON columns are decoded.
struct RawRow {
    id: String,
    conversation_id: String,
    evaluator_type: String,
    status: String,
    model_name: Option<String>,
    prompt_tokens: i64,
    completion_tokens: i64,
    total_tokens: i64,
    estimated_cost_usd: f64,
    error_message: Option<String>,
    scores: String,
    issues: Option<String>,
    confidence: f64,
    raw_output: Option<String>,
    latency_ms: i64,
    created_at: String,
}

fn insert_with(conn: &rusqlite::Connection, eval: &Evaluation) -> anyhow::Result<()> {
    let id = if eval.id.is_empty() {
        Uuid::new_v4().to_string()
    } else {
        eval.id.clone()
    };
    let scores = serde_json::to_string(&eval.scores).context("marshal scores")?;
    let issues = if eval.issues.is_empty() {
        None
    } else {
        Some(serde_json::to_string(&eval.issues).context("marshal issues")?)
    };

    conn.execute(
        "INSERT INTO evaluations (
            id, conversation_id, evaluator_type, status, model_name,
            prompt_tokens, completion_tokens, total_tokens, estimated_cost_usd,
            error_message, scores, issues, confidence, raw_output, latency_ms, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        params![
            id,
            eval.conversation_id,
            eval.evaluator_type.as_str(),
            eval.status.as_str(),
            eval.model_name,
            eval.prompt_tokens,
            eval.completion_tokens,
            eval.total_tokens,
            eval.estimated_cost_usd,
            eval.error_message,
            scores,
            issues,
            eval.confidence,
            eval.raw_output,
            eval.latency_ms,
            to_rfc3339(eval.created_at),
        ],
    )
    .with_context(|| format!("insert evaluation {id}"))?;

    Ok(())
}

impl RawRow {
    fn scan(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            evaluator_type: row.get(2)?,
            status: row.get(3)?,
            model_name: row.get(4)?,
            prompt_tokens: row.get(5)?,
            completion_tokens: row.get(6)?,
            total_tokens: row.get(7)?,
            estimated_cost_usd: row.get(8)?,
            error_message: row.get(9)?,
            scores: row.get(10)?,
            issues: row.get(11)?,
            confidence: row.get(12)?,
            raw_output: row.get(13)?,
            latency_ms: row.get(14)?,
            created_at: row.get(15)?,
        })
    }

    fn decode(self) -> anyhow::Result<Evaluation> {
        let evaluator_type: EvaluatorType = self.evaluator_type.parse()?;
        let status: EvalStatus = self.status.parse()?;
        let scores: Scores = serde_json::from_str(&self.scores).context("unmarshal scores")?;
        let issues: Vec<Issue> = match self.issues.as_deref() {
            Some(json) => serde_json::from_str(json).context("unmarshal issues")?,
            None => vec![],
        };

        Ok(Evaluation {
            id: self.id,
            conversation_id: self.conversation_id,
            evaluator_type,
            status,
            scores,
            model_name: self.model_name,
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
            total_tokens: self.total_tokens,
            estimated_cost_usd: self.estimated_cost_usd,
            error_message: self.error_message,
            issues,
            confidence: self.confidence,
            raw_output: self.raw_output,
            latency_ms: self.latency_ms,
            created_at: parse_rfc3339(&self.created_at)?,
        })
    }
}
