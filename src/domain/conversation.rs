//! Conversation transcript types.
//!
//! A conversation is immutable once ingested: the worker only stamps
//! `processed_at` and the rollup status. Tool parameters and results
//! are opaque JSON so transcripts from any agent runtime round-trip
//! unchanged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::annotation::Feedback;

/// A recorded multi-turn conversation between a user and an assistant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    /// Opaque conversation identifier (primary key everywhere).
    #[serde(rename = "conversation_id")]
    pub id: String,
    /// Version tag of the agent that produced the transcript.
    pub agent_version: String,
    /// Ordered turn sequence.
    #[serde(default)]
    pub turns: Vec<Turn>,
    /// Optional human feedback attached after ingest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<Feedback>,
    /// Free-form metadata carried through unchanged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Set by the worker once evaluation completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
}

/// One turn of a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    /// Monotonic turn number within the conversation.
    pub turn_id: i64,
    /// "user", "assistant", "system", or "tool".
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// A tool invocation made by the assistant within a turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool_name: String,
    /// Opaque structured payload passed to the tool.
    #[serde(default)]
    pub parameters: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ToolResult>,
    #[serde(default)]
    pub latency_ms: i64,
}

/// Outcome of a tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// "success" or "error".
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Conversation {
    /// Sum of tool-call latencies across all turns.
    pub fn total_latency_ms(&self) -> i64 {
        self.turns
            .iter()
            .flat_map(|t| t.tool_calls.iter())
            .map(|tc| tc.latency_ms)
            .sum()
    }

    /// Whether any turn invoked a tool.
    pub fn has_tool_calls(&self) -> bool {
        self.turns.iter().any(|t| !t.tool_calls.is_empty())
    }

    /// Turns spoken by the assistant, in order.
    pub fn assistant_turns(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter().filter(|t| t.role == "assistant")
    }
}
