//! Anthropic messages backend.
//!
//! The messages API takes the system prompt out of band and has no
//! JSON-mode switch; the evaluator prompts already demand a single
//! JSON object and the parsers tolerate fenced output.

use std::time::Instant;

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde::Deserialize;

use super::{CompletionRequest, CompletionResponse, Provider, Usage};

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

pub struct AnthropicProvider {
    api_key: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: MessagesUsage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Default, Deserialize)]
struct MessagesUsage {
    #[serde(default)]
    input_tokens: i64,
    #[serde(default)]
    output_tokens: i64,
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn complete(&self, req: &CompletionRequest) -> anyhow::Result<CompletionResponse> {
        let start = Instant::now();

        let model = req.model.as_deref().unwrap_or(DEFAULT_MODEL);
        let max_tokens = if req.max_tokens == 0 { 2048 } else { req.max_tokens };

        // System messages move to the dedicated field.
        let mut system_prompt = String::new();
        let mut messages = Vec::with_capacity(req.messages.len());
        for m in &req.messages {
            if m.role == "system" {
                system_prompt = m.content.clone();
                continue;
            }
            messages.push(serde_json::json!({"role": m.role, "content": m.content}));
        }

        let mut payload = serde_json::json!({
            "model": model,
            "max_tokens": max_tokens,
            "messages": messages,
            "temperature": req.temperature,
        });
        if !system_prompt.is_empty() {
            payload["system"] = serde_json::Value::String(system_prompt);
        }

        let resp = self
            .client
            .post(API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&payload)
            .send()
            .await
            .context("anthropic request")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("anthropic api error {status}: {body}");
        }

        let parsed: MessagesResponse = resp.json().await.context("decode anthropic response")?;

        let content: String = parsed
            .content
            .iter()
            .filter(|b| b.block_type == "text")
            .map(|b| b.text.as_str())
            .collect();

        Ok(CompletionResponse {
            content,
            finish_reason: parsed.stop_reason.unwrap_or_default(),
            model_name: model.to_string(),
            usage: Usage {
                prompt_tokens: parsed.usage.input_tokens,
                completion_tokens: parsed.usage.output_tokens,
                total_tokens: parsed.usage.input_tokens + parsed.usage.output_tokens,
            },
            latency_ms: start.elapsed().as_millis() as i64,
        })
    }
}
