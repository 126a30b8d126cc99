//! Environment-driven configuration.
//!
//! Every knob has an in-code default so a bare `Config::from_env()`
//! yields a runnable local setup (Redis and Ollama on localhost,
//! SQLite file in the working directory).

use std::time::Duration;

/// Top-level configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub llm: LlmConfig,
    pub worker: WorkerConfig,
    pub evaluator: EvaluatorConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Path of the SQLite database file.
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub openrouter_api_key: Option<String>,
    pub openrouter_model: String,
    pub ollama_base_url: String,
    pub ollama_model: String,
    /// "openai", "anthropic", "ollama", or "openrouter".
    pub default_provider: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub batch_size: usize,
    pub stream_name: String,
    pub consumer_group: String,
    pub consumer_name: String,
}

#[derive(Debug, Clone)]
pub struct EvaluatorConfig {
    /// Per-evaluator deadline inside the orchestrator.
    pub timeout: Duration,
    /// Threshold for the heuristic latency score, in milliseconds.
    pub latency_threshold_ms: i64,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self {
            server: ServerConfig {
                host: env_or("SERVER_HOST", "0.0.0.0"),
                port: env_parse("SERVER_PORT", 8080),
            },
            database: DatabaseConfig {
                path: env_or("DATABASE_PATH", "tribunal.db"),
            },
            redis: RedisConfig {
                url: env_or("REDIS_URL", "redis://127.0.0.1:6379"),
            },
            llm: LlmConfig {
                openai_api_key: env_opt("OPENAI_API_KEY"),
                anthropic_api_key: env_opt("ANTHROPIC_API_KEY"),
                openrouter_api_key: env_opt("OPENROUTER_API_KEY"),
                openrouter_model: env_or(
                    "OPENROUTER_MODEL",
                    "nvidia/nemotron-3-nano-30b-a3b:free",
                ),
                ollama_base_url: env_or("OLLAMA_BASE_URL", "http://localhost:11434"),
                ollama_model: env_or("OLLAMA_MODEL", "llama3.1:8b"),
                default_provider: env_or("LLM_DEFAULT_PROVIDER", "ollama"),
                timeout: Duration::from_secs(env_parse("LLM_TIMEOUT_SECS", 120)),
            },
            worker: WorkerConfig {
                concurrency: env_parse("WORKER_CONCURRENCY", 10),
                batch_size: env_parse("WORKER_BATCH_SIZE", 10),
                stream_name: env_or("WORKER_STREAM_NAME", "conversations"),
                consumer_group: env_or("WORKER_CONSUMER_GROUP", "eval-workers"),
                consumer_name: env_or("WORKER_CONSUMER_NAME", "worker-1"),
            },
            evaluator: EvaluatorConfig {
                timeout: Duration::from_secs(env_parse("EVALUATOR_TIMEOUT_SECS", 30)),
                latency_threshold_ms: env_parse("LATENCY_THRESHOLD_MS", 1000),
            },
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
