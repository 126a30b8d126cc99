//! Ollama backend for locally hosted models.

use std::time::Instant;

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde::Deserialize;

use super::{CompletionRequest, CompletionResponse, Provider, Usage};

pub struct OllamaProvider {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(base_url: String, model: String) -> Self {
        let base_url = if base_url.is_empty() {
            "http://localhost:11434".to_string()
        } else {
            base_url
        };
        let model = if model.is_empty() {
            "llama3.1:8b".to_string()
        } else {
            model
        };
        Self {
            base_url,
            model,
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: ChatMessage,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: i64,
    #[serde(default)]
    eval_count: i64,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: String,
}

#[async_trait]
impl Provider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn complete(&self, req: &CompletionRequest) -> anyhow::Result<CompletionResponse> {
        let start = Instant::now();

        let model = req.model.as_deref().unwrap_or(&self.model);

        let messages: Vec<serde_json::Value> = req
            .messages
            .iter()
            .map(|m| serde_json::json!({"role": m.role, "content": m.content}))
            .collect();

        let mut payload = serde_json::json!({
            "model": model,
            "messages": messages,
            "stream": false,
            "options": {"temperature": req.temperature},
        });
        if req.json_mode {
            payload["format"] = serde_json::Value::String("json".into());
        }

        let url = format!("{}/api/chat", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .context("ollama request")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("ollama error {status}: {body}");
        }

        let parsed: ChatResponse = resp.json().await.context("decode ollama response")?;
        let usage = Usage {
            prompt_tokens: parsed.prompt_eval_count,
            completion_tokens: parsed.eval_count,
            total_tokens: parsed.prompt_eval_count + parsed.eval_count,
        };

        Ok(CompletionResponse {
            content: parsed.message.content,
            finish_reason: parsed.done_reason.unwrap_or_else(|| "stop".into()),
            model_name: model.to_string(),
            usage,
            latency_ms: start.elapsed().as_millis() as i64,
        })
    }
}
