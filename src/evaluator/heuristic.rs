//! Heuristic evaluator: pure checks, no model call.
//!
//! Scores latency against a threshold, penalizes empty assistant
//! turns, and measures the tool execution success ratio. Runs in
//! microseconds, so it anchors the aggregate even when every
//! model-backed evaluator is down.

use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::domain::{
    Conversation, EvalStatus, Evaluation, EvaluatorType, Issue, Scores, Severity,
};

use super::Evaluator;

pub struct HeuristicEvaluator {
    latency_threshold_ms: i64,
    weight: f64,
}

impl HeuristicEvaluator {
    pub fn new(latency_threshold_ms: i64) -> Self {
        let latency_threshold_ms = if latency_threshold_ms <= 0 {
            1000
        } else {
            latency_threshold_ms
        };
        Self {
            latency_threshold_ms,
            weight: 0.20,
        }
    }

    /// 1.0 within the threshold, 0.7 up to 2x, 0.3 beyond.
    fn check_latency(&self, conv: &Conversation, issues: &mut Vec<Issue>) -> f64 {
        let total = conv.total_latency_ms();

        if total > self.latency_threshold_ms * 2 {
            issues.push(Issue {
                issue_type: "latency".into(),
                severity: Severity::Error,
                description: "Response latency significantly exceeds threshold".into(),
                turn_id: None,
            });
            return 0.3;
        }

        if total > self.latency_threshold_ms {
            issues.push(Issue {
                issue_type: "latency".into(),
                severity: Severity::Warning,
                description: "Response latency exceeds threshold".into(),
                turn_id: None,
            });
            return 0.7;
        }

        1.0
    }

    /// Start at 1.0, subtract 0.3 per empty assistant turn, floor 0.
    fn check_format(&self, conv: &Conversation, issues: &mut Vec<Issue>) -> f64 {
        let mut score = 1.0f64;

        for turn in &conv.turns {
            if turn.role == "assistant" && turn.content.is_empty() {
                issues.push(Issue {
                    issue_type: "format".into(),
                    severity: Severity::Error,
                    description: "Empty assistant response".into(),
                    turn_id: Some(turn.turn_id),
                });
                score -= 0.3;
            }
        }

        score.max(0.0)
    }

    /// Ratio of successful tool calls; 1.0 when there are none.
    fn check_tool_execution(&self, conv: &Conversation, issues: &mut Vec<Issue>) -> f64 {
        let mut total_calls = 0u32;
        let mut success_calls = 0u32;

        for turn in &conv.turns {
            for tc in &turn.tool_calls {
                total_calls += 1;
                match tc.result.as_ref().map(|r| r.status.as_str()) {
                    Some("success") => success_calls += 1,
                    Some("error") => issues.push(Issue {
                        issue_type: "tool_execution".into(),
                        severity: Severity::Error,
                        description: format!("Tool execution failed: {}", tc.tool_name),
                        turn_id: Some(turn.turn_id),
                    }),
                    _ => {}
                }
            }
        }

        if total_calls == 0 {
            return 1.0;
        }
        f64::from(success_calls) / f64::from(total_calls)
    }
}

#[async_trait]
impl Evaluator for HeuristicEvaluator {
    fn name(&self) -> &'static str {
        "heuristic"
    }

    fn kind(&self) -> EvaluatorType {
        EvaluatorType::Heuristic
    }

    fn weight(&self) -> f64 {
        self.weight
    }

    async fn evaluate(&self, conv: &Conversation) -> anyhow::Result<Evaluation> {
        let start = Instant::now();
        let mut issues = Vec::new();

        let latency_score = self.check_latency(conv, &mut issues);
        let format_score = self.check_format(conv, &mut issues);
        let tool_score = self.check_tool_execution(conv, &mut issues);

        let scores = Scores {
            overall: (latency_score + format_score + tool_score) / 3.0,
            response_quality: format_score,
            tool_accuracy: tool_score,
            ..Default::default()
        };

        Ok(Evaluation {
            id: Uuid::new_v4().to_string(),
            conversation_id: conv.id.clone(),
            evaluator_type: EvaluatorType::Heuristic,
            status: EvalStatus::Success,
            scores,
            model_name: None,
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
            estimated_cost_usd: 0.0,
            error_message: None,
            issues,
            confidence: 0.95,
            raw_output: None,
            latency_ms: start.elapsed().as_millis() as i64,
            created_at: Utc::now(),
        })
    }
}
