//! OpenRouter backend (OpenAI-compatible wire format).
//!
//! Free-tier routing rate-limits aggressively, so 429 responses are
//! retried with exponential backoff before the error is surfaced.

use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde::Deserialize;

use super::{CompletionRequest, CompletionResponse, Provider, Usage};

const API_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
const DEFAULT_MODEL: &str = "nvidia/nemotron-3-nano-30b-a3b:free";
const MAX_RETRIES: u32 = 3;

pub struct OpenRouterProvider {
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl OpenRouterProvider {
    pub fn new(api_key: String, model: String) -> Self {
        let model = if model.is_empty() {
            DEFAULT_MODEL.to_string()
        } else {
            model
        };
        Self {
            api_key,
            model,
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: ChatUsage,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Default, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: i64,
    #[serde(default)]
    completion_tokens: i64,
    #[serde(default)]
    total_tokens: i64,
}

#[async_trait]
impl Provider for OpenRouterProvider {
    fn name(&self) -> &str {
        "openrouter"
    }

    async fn complete(&self, req: &CompletionRequest) -> anyhow::Result<CompletionResponse> {
        let start = Instant::now();

        let model = req.model.as_deref().unwrap_or(&self.model);
        let max_tokens = if req.max_tokens == 0 { 2048 } else { req.max_tokens };

        let messages: Vec<serde_json::Value> = req
            .messages
            .iter()
            .map(|m| serde_json::json!({"role": m.role, "content": m.content}))
            .collect();

        let mut payload = serde_json::json!({
            "model": model,
            "messages": messages,
            "max_tokens": max_tokens,
            "temperature": req.temperature,
        });
        if req.json_mode {
            payload["response_format"] = serde_json::json!({"type": "json_object"});
        }

        let mut attempt = 0u32;
        let resp = loop {
            let resp = self
                .client
                .post(API_URL)
                .bearer_auth(&self.api_key)
                .json(&payload)
                .send()
                .await
                .context("openrouter request")?;

            if resp.status().as_u16() == 429 && attempt < MAX_RETRIES {
                let wait = Duration::from_secs(1u64 << attempt);
                tracing::warn!(attempt, wait_secs = wait.as_secs(), "openrouter rate limited, backing off");
                tokio::time::sleep(wait).await;
                attempt += 1;
                continue;
            }
            break resp;
        };

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("openrouter api error {status}: {body}");
        }

        let parsed: ChatResponse = resp.json().await.context("decode openrouter response")?;
        let Some(choice) = parsed.choices.into_iter().next() else {
            bail!("no choices in openrouter response");
        };

        Ok(CompletionResponse {
            content: choice.message.content,
            finish_reason: choice.finish_reason.unwrap_or_default(),
            model_name: model.to_string(),
            usage: Usage {
                prompt_tokens: parsed.usage.prompt_tokens,
                completion_tokens: parsed.usage.completion_tokens,
                total_tokens: parsed.usage.total_tokens,
            },
            latency_ms: start.elapsed().as_millis() as i64,
        })
    }
}
