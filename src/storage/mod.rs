//! SQLite persistence.
//!
//! Each store owns the database path and opens a connection per
//! operation; SQLite's file locking plus a busy timeout handles
//! concurrent workers. Nested structures (turns, scores, issues) are
//! JSON text columns keyed by stable record ids, so redelivered jobs
//! upsert instead of duplicating.

pub mod conversations;
pub mod evaluations;
pub mod review_queue;

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use rusqlite::Connection;

pub use conversations::ConversationStore;
pub use evaluations::EvaluationStore;
pub use review_queue::ReviewQueueStore;

pub(crate) fn open(path: &Path) -> anyhow::Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("open database {}", path.display()))?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

pub(crate) fn to_rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

pub(crate) fn parse_rfc3339(s: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("parse timestamp {s:?}"))?
        .with_timezone(&Utc))
}
