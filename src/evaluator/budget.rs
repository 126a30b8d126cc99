//! Token and cost budgeting.
//!
//! Budgets are advisory: exceedance flags the aggregate and is
//! logged, but never fails a job. Prompt pre-flight checks, in
//! contrast, fail the individual evaluator before a model call is
//! made.

use anyhow::bail;

use crate::domain::AggregatedTokenUsage;

/// Approximate tokens in a piece of text, at roughly 4 chars/token.
pub fn estimate_tokens(text: &str) -> usize {
    text.len() / 4
}

/// Per-1K-token prices (prompt, completion) in USD.
///
/// Unknown models, including self-hosted ones, cost nothing.
const MODEL_PRICES: &[(&str, f64, f64)] = &[
    ("gpt-4o", 0.0025, 0.010),
    ("gpt-4o-mini", 0.00015, 0.0006),
    ("gpt-4", 0.03, 0.06),
    ("gpt-4-turbo", 0.01, 0.03),
    ("gpt-3.5-turbo", 0.0005, 0.0015),
    ("claude-3-opus", 0.015, 0.075),
    ("claude-3-sonnet", 0.003, 0.015),
    ("claude-3-haiku", 0.00025, 0.00125),
    ("claude-3-5-sonnet", 0.003, 0.015),
];

/// Estimated cost of a model call in USD.
pub fn calculate_cost(model: &str, prompt_tokens: i64, completion_tokens: i64) -> f64 {
    let Some((_, prompt_price, completion_price)) =
        MODEL_PRICES.iter().find(|(name, _, _)| *name == model)
    else {
        return 0.0;
    };

    (prompt_tokens as f64 / 1000.0) * prompt_price
        + (completion_tokens as f64 / 1000.0) * completion_price
}

/// Enforces the token and cost envelope for one evaluation.
pub struct BudgetEnforcer {
    /// Aggregate token cap across all evaluators of one job.
    max_total_tokens: i64,
    /// Aggregate cost cap in USD.
    max_total_cost: f64,
    /// Pre-flight cap for a single evaluator prompt.
    max_prompt_tokens: usize,
}

impl Default for BudgetEnforcer {
    fn default() -> Self {
        Self::new()
    }
}

impl BudgetEnforcer {
    pub fn new() -> Self {
        Self {
            max_total_tokens: 50_000,
            max_total_cost: 10.0,
            max_prompt_tokens: 20_000,
        }
    }

    /// Fail an evaluator before the model call if its prompt is
    /// oversized. Not retryable: the same prompt will overflow again.
    pub fn check_prompt(&self, prompt: &str) -> anyhow::Result<()> {
        let estimated = estimate_tokens(prompt);
        if estimated > self.max_prompt_tokens {
            bail!(
                "prompt exceeds token budget: {} > {}",
                estimated,
                self.max_prompt_tokens
            );
        }
        Ok(())
    }

    /// Check the aggregate envelope, flagging the usage on exceedance.
    /// Callers log the error and continue; the job is never failed on
    /// budget alone.
    pub fn check_aggregate(&self, usage: &mut AggregatedTokenUsage) -> anyhow::Result<()> {
        if usage.total_tokens > self.max_total_tokens {
            usage.budget_exceeded = true;
            bail!(
                "evaluation exceeded token budget: {} > {}",
                usage.total_tokens,
                self.max_total_tokens
            );
        }
        if usage.total_cost > self.max_total_cost {
            usage.budget_exceeded = true;
            bail!(
                "evaluation exceeded cost budget: ${:.2} > ${:.2}",
                usage.total_cost,
                self.max_total_cost
            );
        }
        Ok(())
    }
}
