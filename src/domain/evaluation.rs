//! Evaluation records: per-evaluator results and the per-conversation
//! rollup produced by the orchestrator.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The four evaluator strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluatorType {
    LlmJudge,
    ToolCall,
    Coherence,
    Heuristic,
}

impl EvaluatorType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LlmJudge => "llm_judge",
            Self::ToolCall => "tool_call",
            Self::Coherence => "coherence",
            Self::Heuristic => "heuristic",
        }
    }
}

impl std::fmt::Display for EvaluatorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EvaluatorType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "llm_judge" => Ok(Self::LlmJudge),
            "tool_call" => Ok(Self::ToolCall),
            "coherence" => Ok(Self::Coherence),
            "heuristic" => Ok(Self::Heuristic),
            other => Err(anyhow::anyhow!("unknown evaluator type: {other}")),
        }
    }
}

/// Outcome of a single evaluator attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalStatus {
    Success,
    Failed,
    Timeout,
    RateLimited,
    ContextOverflow,
}

impl EvalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::ContextOverflow => "context_overflow",
        }
    }
}

impl std::str::FromStr for EvalStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            "rate_limited" => Ok(Self::RateLimited),
            "context_overflow" => Ok(Self::ContextOverflow),
            other => Err(anyhow::anyhow!("unknown evaluation status: {other}")),
        }
    }
}

/// Score dimensions, all in [0, 1].
///
/// Each evaluator populates only the dimensions it is responsible
/// for; the rest stay at zero and contribute nothing beyond their
/// evaluator's weight during aggregation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Scores {
    pub overall: f64,
    pub response_quality: f64,
    pub helpfulness: f64,
    pub factuality: f64,
    pub tool_accuracy: f64,
    pub selection_accuracy: f64,
    pub parameter_accuracy: f64,
    pub coherence: f64,
    pub consistency: f64,
}

/// Severity of a detected issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

/// A problem surfaced by an evaluator, optionally anchored to a turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    #[serde(rename = "type")]
    pub issue_type: String,
    pub severity: Severity,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<i64>,
}

/// One record per (conversation, evaluator, attempt).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    pub id: String,
    pub conversation_id: String,
    pub evaluator_type: EvaluatorType,
    pub status: EvalStatus,
    #[serde(default)]
    pub scores: Scores,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(default)]
    pub prompt_tokens: i64,
    #[serde(default)]
    pub completion_tokens: i64,
    #[serde(default)]
    pub total_tokens: i64,
    #[serde(default)]
    pub estimated_cost_usd: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<Issue>,
    #[serde(default)]
    pub confidence: f64,
    /// Raw model output, kept opaque for audit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<String>,
    #[serde(default)]
    pub latency_ms: i64,
    pub created_at: DateTime<Utc>,
}

/// Rollup status across all evaluators of one conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregatedStatus {
    Success,
    Partial,
    Failed,
}

impl AggregatedStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for AggregatedStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed evaluator, recorded with a retryability hint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatorFailure {
    pub evaluator_type: EvaluatorType,
    pub error_message: String,
    pub retryable: bool,
}

/// Token and cost accounting for one evaluator's model call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    #[serde(rename = "estimated_cost_usd")]
    pub estimated_cost: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
}

/// Token and cost rollup across the whole evaluation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregatedTokenUsage {
    pub total_tokens: i64,
    #[serde(rename = "total_cost_usd")]
    pub total_cost: f64,
    #[serde(default)]
    pub by_evaluator: HashMap<EvaluatorType, TokenUsage>,
    #[serde(default)]
    pub budget_exceeded: bool,
}

/// Summary of the tool-call evaluator's verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolEvaluation {
    pub selection_accuracy: f64,
    pub parameter_accuracy: f64,
    pub execution_success: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hallucinated_params: Vec<String>,
}

/// Per-conversation rollup of all evaluator outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedEvaluation {
    pub conversation_id: String,
    pub status: AggregatedStatus,
    pub scores: Scores,
    pub token_usage: AggregatedTokenUsage,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_evaluators: Vec<EvaluatorFailure>,
    pub successful_count: usize,
    pub expected_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_evaluation: Option<ToolEvaluation>,
    #[serde(rename = "issues_detected")]
    pub issues: Vec<Issue>,
    /// Every per-evaluator record of this attempt, failed ones included.
    pub evaluations: Vec<Evaluation>,
    pub created_at: DateTime<Utc>,
}

impl AggregatedEvaluation {
    /// Mean confidence across successful evaluations, 0.0 when none.
    pub fn mean_confidence(&self) -> f64 {
        let successes: Vec<_> = self
            .evaluations
            .iter()
            .filter(|e| e.status == EvalStatus::Success)
            .collect();
        if successes.is_empty() {
            return 0.0;
        }
        successes.iter().map(|e| e.confidence).sum::<f64>() / successes.len() as f64
    }
}
