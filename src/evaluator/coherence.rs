//! Coherence evaluator: does the assistant keep context across turns
//! and avoid contradicting itself?
//!
//! Transcripts shorter than three turns are trivially coherent. Long
//! transcripts are windowed: the older prefix is replaced by a model
//! summary (deterministic fallback when the summary call fails) and
//! only the recent window is included verbatim.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::domain::{
    Conversation, EvalStatus, Evaluation, EvaluatorType, Issue, Scores, Severity, Turn,
};
use crate::llm::{Client, CompletionRequest, Message};

use super::budget::{calculate_cost, BudgetEnforcer};
use super::{extract_json_block, Evaluator, MessageSanitizer};

const SYSTEM_PROMPT: &str =
    "You are an expert at evaluating conversation coherence and consistency. Always respond with valid JSON.";

pub struct CoherenceEvaluator {
    client: Arc<Client>,
    sanitizer: MessageSanitizer,
    budget: BudgetEnforcer,
    weight: f64,
    window_size: usize,
}

impl CoherenceEvaluator {
    pub fn new(client: Arc<Client>) -> Self {
        Self {
            client,
            sanitizer: MessageSanitizer::new(),
            budget: BudgetEnforcer::new(),
            weight: 0.15,
            window_size: 10,
        }
    }

    async fn build_prompt(&self, conv: &Conversation) -> String {
        let mut prompt =
            String::from("Evaluate coherence and consistency in this multi-turn conversation:\n\n");

        // Sanitize first, then window: no un-sanitized text may reach
        // the model, including through the summary path.
        let mut turns = self.sanitizer.prepare(&conv.turns);

        if turns.len() > self.window_size * 2 {
            let split = turns.len() - self.window_size;
            prompt.push_str("[Earlier conversation summarized]\n");
            prompt.push_str(&self.summarize_prefix(&turns[..split]).await);
            prompt.push_str("\n[Recent turns in full]\n\n");
            turns = turns.split_off(split);
        }

        for turn in &turns {
            prompt.push_str(&format!(
                "[{}] (Turn {}): {}\n\n",
                turn.role.to_uppercase(),
                turn.turn_id,
                turn.content
            ));
        }

        prompt.push_str(
            r#"
Evaluate:
1. Coherence (0-1): Does the assistant maintain context across turns?
2. Consistency (0-1): Are there any contradictions in assistant responses?
3. Reference handling: Does the assistant properly resolve pronouns and references?

Look for:
- Context loss (forgetting earlier information)
- Contradictions between responses
- Improper handling of references to earlier turns

Respond with JSON:
{
  "coherence": <float>,
  "consistency": <float>,
  "overall": <float>,
  "confidence": <float>,
  "context_losses": [{"turn_id": <int>, "description": "..."}],
  "contradictions": [{"turn_ids": [<int>, <int>], "description": "..."}],
  "issues": [{"type": "...", "severity": "error|warning|info", "description": "...", "turn_id": <int or null>}],
  "reasoning": "..."
}"#,
        );

        prompt
    }

    /// Model-generated prefix summary, falling back to a deterministic
    /// digest of the first user turns when the call fails.
    async fn summarize_prefix(&self, turns: &[Turn]) -> String {
        let mut transcript = String::new();
        for turn in turns {
            transcript.push_str(&format!("[{}] {}\n", turn.role.to_uppercase(), turn.content));
        }

        let req = CompletionRequest {
            model: None,
            messages: vec![Message::user(format!(
                "Summarize the following conversation prefix in 3-5 sentences, \
                 keeping the facts and requests that later turns may refer back to:\n\n{transcript}"
            ))],
            max_tokens: 256,
            temperature: 0.1,
            json_mode: false,
        };

        match self.client.complete(&req).await {
            Ok(resp) if !resp.content.trim().is_empty() => resp.content,
            Ok(_) => deterministic_summary(turns),
            Err(e) => {
                tracing::debug!(error = %e, "prefix summary call failed, using deterministic summary");
                deterministic_summary(turns)
            }
        }
    }

    /// Trivially coherent evaluation for very short conversations.
    fn perfect(&self, conv: &Conversation, start: Instant) -> Evaluation {
        Evaluation {
            id: Uuid::new_v4().to_string(),
            conversation_id: conv.id.clone(),
            evaluator_type: EvaluatorType::Coherence,
            status: EvalStatus::Success,
            scores: Scores {
                overall: 1.0,
                coherence: 1.0,
                consistency: 1.0,
                ..Default::default()
            },
            model_name: None,
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
            estimated_cost_usd: 0.0,
            error_message: None,
            issues: vec![],
            confidence: 1.0,
            raw_output: None,
            latency_ms: start.elapsed().as_millis() as i64,
            created_at: Utc::now(),
        }
    }
}

/// Digest of the first five user turns, clipped to 100 chars each.
fn deterministic_summary(turns: &[Turn]) -> String {
    let mut summary = String::from("Key points from earlier conversation:\n");

    for turn in turns.iter().filter(|t| t.role == "user").take(5) {
        let content: String = turn.content.chars().take(100).collect();
        let ellipsis = if turn.content.chars().count() > 100 {
            "..."
        } else {
            ""
        };
        summary.push_str(&format!(
            "- User (Turn {}): {content}{ellipsis}\n",
            turn.turn_id
        ));
    }

    summary
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CoherenceResponse {
    coherence: f64,
    consistency: f64,
    overall: f64,
    confidence: f64,
    context_losses: Vec<ContextLoss>,
    contradictions: Vec<Contradiction>,
    issues: Vec<Issue>,
}

#[derive(Debug, Deserialize)]
struct ContextLoss {
    turn_id: i64,
    description: String,
}

#[derive(Debug, Deserialize)]
struct Contradiction {
    #[serde(default)]
    turn_ids: Vec<i64>,
    description: String,
}

fn parse_response(content: &str) -> anyhow::Result<CoherenceResponse> {
    let mut result: CoherenceResponse = serde_json::from_str(extract_json_block(content))
        .context("unmarshal coherence response")?;

    if result.overall == 0.0 {
        result.overall = (result.coherence + result.consistency) / 2.0;
    }
    if result.confidence == 0.0 {
        result.confidence = 0.8;
    }

    for loss in &result.context_losses {
        result.issues.push(Issue {
            issue_type: "context_loss".into(),
            severity: Severity::Warning,
            description: loss.description.clone(),
            turn_id: Some(loss.turn_id),
        });
    }

    for contradiction in &result.contradictions {
        result.issues.push(Issue {
            issue_type: "contradiction".into(),
            severity: Severity::Error,
            description: contradiction.description.clone(),
            turn_id: contradiction.turn_ids.first().copied(),
        });
    }

    Ok(result)
}

#[async_trait]
impl Evaluator for CoherenceEvaluator {
    fn name(&self) -> &'static str {
        "coherence"
    }

    fn kind(&self) -> EvaluatorType {
        EvaluatorType::Coherence
    }

    fn weight(&self) -> f64 {
        self.weight
    }

    async fn evaluate(&self, conv: &Conversation) -> anyhow::Result<Evaluation> {
        let start = Instant::now();

        if conv.turns.len() < 3 {
            return Ok(self.perfect(conv, start));
        }

        let prompt = self.build_prompt(conv).await;
        self.budget.check_prompt(&prompt)?;

        let resp = self
            .client
            .complete(&CompletionRequest {
                model: None,
                messages: vec![Message::system(SYSTEM_PROMPT), Message::user(prompt)],
                max_tokens: 1024,
                temperature: 0.1,
                json_mode: true,
            })
            .await
            .context("llm completion")?;

        let result = parse_response(&resp.content)?;
        let cost = calculate_cost(
            &resp.model_name,
            resp.usage.prompt_tokens,
            resp.usage.completion_tokens,
        );

        Ok(Evaluation {
            id: Uuid::new_v4().to_string(),
            conversation_id: conv.id.clone(),
            evaluator_type: EvaluatorType::Coherence,
            status: EvalStatus::Success,
            scores: Scores {
                overall: result.overall,
                coherence: result.coherence,
                consistency: result.consistency,
                ..Default::default()
            },
            model_name: Some(resp.model_name),
            prompt_tokens: resp.usage.prompt_tokens,
            completion_tokens: resp.usage.completion_tokens,
            total_tokens: resp.usage.total_tokens,
            estimated_cost_usd: cost,
            error_message: None,
            issues: result.issues,
            confidence: result.confidence,
            raw_output: Some(resp.content),
            latency_ms: start.elapsed().as_millis() as i64,
            created_at: Utc::now(),
        })
    }
}
