//! Evaluation worker: drains the conversation stream and runs the
//! evaluate-persist-route lifecycle for each entry.

use std::sync::Arc;

use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use tribunal::config::Config;
use tribunal::evaluator::{
    CoherenceEvaluator, Evaluator, HeuristicEvaluator, LlmJudgeEvaluator, Orchestrator,
    ToolCallEvaluator,
};
use tribunal::llm::Client;
use tribunal::queue::RedisStreamQueue;
use tribunal::storage::{ConversationStore, EvaluationStore, ReviewQueueStore};
use tribunal::worker::Worker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cfg = Config::from_env();
    let db_path = std::path::Path::new(&cfg.database.path);

    let conversations = Arc::new(ConversationStore::new(db_path)?);
    let evaluations = Arc::new(EvaluationStore::new(db_path)?);
    let reviews = Arc::new(ReviewQueueStore::new(db_path)?);

    let queue = Arc::new(
        RedisStreamQueue::connect(
            &cfg.redis.url,
            &cfg.worker.stream_name,
            &cfg.worker.consumer_group,
            &cfg.worker.consumer_name,
        )
        .await?,
    );

    let client = Arc::new(Client::from_config(&cfg.llm)?);
    tracing::info!(provider = client.default_provider(), "model client ready");

    let evaluators: Vec<Arc<dyn Evaluator>> = vec![
        Arc::new(HeuristicEvaluator::new(cfg.evaluator.latency_threshold_ms)),
        Arc::new(LlmJudgeEvaluator::new(client.clone())),
        Arc::new(ToolCallEvaluator::new(client.clone())),
        Arc::new(CoherenceEvaluator::new(client)),
    ];
    let orchestrator = Arc::new(Orchestrator::new(evaluators, cfg.evaluator.timeout));

    let worker = Arc::new(Worker::new(
        queue,
        conversations,
        evaluations,
        reviews,
        orchestrator,
        cfg.worker.concurrency,
        cfg.worker.batch_size,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutting down worker");
            let _ = shutdown_tx.send(true);
        }
    });

    worker.run(shutdown_rx).await
}
