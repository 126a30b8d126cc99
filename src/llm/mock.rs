//! Scripted provider for tests: canned content or a canned error,
//! an optional artificial delay, and a call counter.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;

use super::{CompletionRequest, CompletionResponse, Provider, Usage};

pub struct MockProvider {
    name: String,
    content: String,
    error: Option<String>,
    delay: Duration,
    usage: Usage,
    calls: AtomicUsize,
    last_request: Mutex<Option<CompletionRequest>>,
}

impl MockProvider {
    /// A provider that always answers with the given content.
    pub fn json(name: &str, content: &str) -> Self {
        Self {
            name: name.to_string(),
            content: content.to_string(),
            error: None,
            delay: Duration::ZERO,
            usage: Usage {
                prompt_tokens: 100,
                completion_tokens: 50,
                total_tokens: 150,
            },
            calls: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        }
    }

    /// A provider that always fails with the given message.
    pub fn error(name: &str, message: &str) -> Self {
        Self {
            error: Some(message.to_string()),
            ..Self::json(name, "")
        }
    }

    /// Delay every completion, for deadline tests.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Override the reported token usage.
    pub fn with_usage(mut self, prompt: i64, completion: i64) -> Self {
        self.usage = Usage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: prompt + completion,
        };
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The most recent request, for prompt-content assertions.
    pub fn last_request(&self) -> Option<CompletionRequest> {
        self.last_request.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, req: &CompletionRequest) -> anyhow::Result<CompletionResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(req.clone());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if let Some(ref message) = self.error {
            bail!("{message}");
        }

        Ok(CompletionResponse {
            content: self.content.clone(),
            finish_reason: "stop".into(),
            model_name: format!("mock-{}", self.name),
            usage: self.usage,
            latency_ms: self.delay.as_millis() as i64,
        })
    }
}
