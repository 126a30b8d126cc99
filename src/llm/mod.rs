//! Uniform completion interface over pluggable model backends.
//!
//! Concrete providers (OpenAI, Anthropic, Ollama, OpenRouter) all
//! implement [`Provider`]; the [`Client`] owns the configured set,
//! routes to a named default, and can fall back across every backend
//! when the default is down. The client is shared across evaluator
//! tasks and safe to call concurrently.

pub mod anthropic;
pub mod ollama;
pub mod openai;
pub mod openrouter;

#[cfg(test)]
pub mod mock;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;

use crate::config::LlmConfig;

pub use anthropic::AnthropicProvider;
pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;
pub use openrouter::OpenRouterProvider;

/// One chat message in a completion request.
#[derive(Debug, Clone)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

/// A completion request in provider-neutral form.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Model override; providers pick their default when `None`.
    pub model: Option<String>,
    pub messages: Vec<Message>,
    pub max_tokens: u32,
    pub temperature: f64,
    /// Ask the backend for a single JSON object. Advisory on
    /// backends without a native switch.
    pub json_mode: bool,
}

/// Token accounting reported by the backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct Usage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

/// A completed model response.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub finish_reason: String,
    pub model_name: String,
    pub usage: Usage,
    pub latency_ms: i64,
}

/// A single model backend.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, req: &CompletionRequest) -> anyhow::Result<CompletionResponse>;
}

/// Shared model client: named default provider, fallback-any policy,
/// and a per-request deadline.
pub struct Client {
    providers: HashMap<String, Arc<dyn Provider>>,
    default_provider: String,
    timeout: Duration,
}

impl Client {
    /// Build the client from configuration. At least one backend must
    /// be configured; if the named default is absent, any configured
    /// backend is promoted.
    pub fn from_config(cfg: &LlmConfig) -> anyhow::Result<Self> {
        let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();

        if !cfg.ollama_base_url.is_empty() {
            providers.insert(
                "ollama".into(),
                Arc::new(OllamaProvider::new(
                    cfg.ollama_base_url.clone(),
                    cfg.ollama_model.clone(),
                )),
            );
        }
        if let Some(ref key) = cfg.openai_api_key {
            providers.insert("openai".into(), Arc::new(OpenAiProvider::new(key.clone())));
        }
        if let Some(ref key) = cfg.anthropic_api_key {
            providers.insert(
                "anthropic".into(),
                Arc::new(AnthropicProvider::new(key.clone())),
            );
        }
        if let Some(ref key) = cfg.openrouter_api_key {
            providers.insert(
                "openrouter".into(),
                Arc::new(OpenRouterProvider::new(
                    key.clone(),
                    cfg.openrouter_model.clone(),
                )),
            );
        }

        if providers.is_empty() {
            bail!("no model providers configured");
        }

        let default_provider = if providers.contains_key(&cfg.default_provider) {
            cfg.default_provider.clone()
        } else {
            providers
                .keys()
                .next()
                .cloned()
                .context("provider map cannot be empty here")?
        };

        Ok(Self {
            providers,
            default_provider,
            timeout: cfg.timeout,
        })
    }

    /// Build a client over explicit providers, for tests and embedding.
    pub fn with_providers(
        providers: Vec<Arc<dyn Provider>>,
        default_provider: &str,
        timeout: Duration,
    ) -> Self {
        Self {
            providers: providers
                .into_iter()
                .map(|p| (p.name().to_string(), p))
                .collect(),
            default_provider: default_provider.to_string(),
            timeout,
        }
    }

    pub fn default_provider(&self) -> &str {
        &self.default_provider
    }

    /// Complete with the default provider.
    pub async fn complete(&self, req: &CompletionRequest) -> anyhow::Result<CompletionResponse> {
        self.complete_with(&self.default_provider, req).await
    }

    /// Complete with a named provider, under the client deadline.
    pub async fn complete_with(
        &self,
        provider_name: &str,
        req: &CompletionRequest,
    ) -> anyhow::Result<CompletionResponse> {
        let provider = self
            .providers
            .get(provider_name)
            .with_context(|| format!("provider {provider_name} not found"))?;

        match tokio::time::timeout(self.timeout, provider.complete(req)).await {
            Ok(result) => result,
            Err(_) => bail!(
                "model request timeout after {}s ({provider_name})",
                self.timeout.as_secs()
            ),
        }
    }

    /// Try every configured provider until one succeeds.
    pub async fn complete_with_fallback(
        &self,
        req: &CompletionRequest,
    ) -> anyhow::Result<CompletionResponse> {
        let mut last_err = None;

        // Default first, then the rest in map order.
        let mut names: Vec<&String> = self.providers.keys().collect();
        names.sort_by_key(|n| (*n != &self.default_provider, n.as_str().to_string()));

        for name in names {
            match self.complete_with(name, req).await {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    tracing::warn!(provider = %name, error = %e, "provider failed, trying next");
                    last_err = Some(e);
                }
            }
        }

        match last_err {
            Some(e) => Err(e.context("all providers failed")),
            None => bail!("no model providers configured"),
        }
    }
}
