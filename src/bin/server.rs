//! HTTP server: ingest and inspection surface.

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use tribunal::api::{self, AppState};
use tribunal::config::Config;
use tribunal::queue::RedisStreamQueue;
use tribunal::storage::{ConversationStore, EvaluationStore, ReviewQueueStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cfg = Config::from_env();
    let db_path = std::path::Path::new(&cfg.database.path);

    let state = AppState {
        conversations: Arc::new(ConversationStore::new(db_path)?),
        evaluations: Arc::new(EvaluationStore::new(db_path)?),
        reviews: Arc::new(ReviewQueueStore::new(db_path)?),
        queue: Arc::new(
            RedisStreamQueue::connect(
                &cfg.redis.url,
                &cfg.worker.stream_name,
                &cfg.worker.consumer_group,
                &cfg.worker.consumer_name,
            )
            .await?,
        ),
    };

    let app = api::router(state);
    let addr = cfg.server.addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;

    tracing::info!(%addr, "server starting");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serve")?;

    tracing::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        return;
    }
    tracing::info!("shutting down server");
}
