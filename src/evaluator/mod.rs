//! Evaluator strategies and the fan-out orchestrator.
//!
//! Every strategy implements [`Evaluator`]; the orchestrator owns an
//! ordered registry and runs them in parallel under a per-task
//! deadline. Adding a strategy is additive: implement the trait,
//! register it, pick a weight.

pub mod budget;
pub mod coherence;
pub mod heuristic;
pub mod llm_judge;
pub mod orchestrator;
pub mod sanitizer;
pub mod tool_call;

use async_trait::async_trait;

use crate::domain::{Conversation, Evaluation, EvaluatorType};

pub use budget::BudgetEnforcer;
pub use coherence::CoherenceEvaluator;
pub use heuristic::HeuristicEvaluator;
pub use llm_judge::LlmJudgeEvaluator;
pub use orchestrator::Orchestrator;
pub use sanitizer::MessageSanitizer;
pub use tool_call::ToolCallEvaluator;

/// A pluggable strategy that scores a conversation along one or more
/// dimensions.
#[async_trait]
pub trait Evaluator: Send + Sync {
    fn name(&self) -> &'static str;

    fn kind(&self) -> EvaluatorType;

    /// Contribution of this evaluator to the aggregate, relative to
    /// the other registered evaluators.
    fn weight(&self) -> f64;

    async fn evaluate(&self, conv: &Conversation) -> anyhow::Result<Evaluation>;
}

/// Extract JSON from model output that may be wrapped in markdown
/// fences. Returns the input unchanged when no fence is found.
pub(crate) fn extract_json_block(text: &str) -> &str {
    if let Some(start) = text.find("```json") {
        let json_start = start + 7;
        if let Some(end) = text[json_start..].find("```") {
            return text[json_start..json_start + end].trim();
        }
    }
    if let Some(start) = text.find("```") {
        let block_start = start + 3;
        if let Some(end) = text[block_start..].find("```") {
            let candidate = text[block_start..block_start + end].trim();
            // Skip a language identifier line if present.
            if let Some(nl) = candidate.find('\n') {
                if !candidate[..nl].trim_start().starts_with('{') {
                    return candidate[nl + 1..].trim();
                }
            }
            return candidate;
        }
    }
    text.trim()
}
