//! Worker pool: a poller feeds a bounded job channel, C workers drain
//! it, each job runs the full evaluate-persist-route-ack lifecycle.
//!
//! Backpressure is the channel itself: the poller blocks on send when
//! the workers fall behind, which stops it fetching more stream
//! entries. On shutdown the poller closes the channel and workers
//! drain what is already in flight before exiting.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{mpsc, watch, Mutex};

use crate::domain::Conversation;
use crate::evaluator::Orchestrator;
use crate::feedback::{AgreementCalculator, ReviewRouter};
use crate::queue::{Queue, QueueEntry};
use crate::storage::{ConversationStore, EvaluationStore, ReviewQueueStore};

/// How long one consume call blocks waiting for new entries.
const CONSUME_BLOCK: Duration = Duration::from_secs(5);
/// Backoff after a transient queue error.
const QUEUE_RETRY_DELAY: Duration = Duration::from_secs(1);

pub struct Worker {
    queue: Arc<dyn Queue>,
    conversations: Arc<ConversationStore>,
    evaluations: Arc<EvaluationStore>,
    reviews: Arc<ReviewQueueStore>,
    orchestrator: Arc<Orchestrator>,
    agreement: AgreementCalculator,
    router: ReviewRouter,
    concurrency: usize,
    batch_size: usize,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<dyn Queue>,
        conversations: Arc<ConversationStore>,
        evaluations: Arc<EvaluationStore>,
        reviews: Arc<ReviewQueueStore>,
        orchestrator: Arc<Orchestrator>,
        concurrency: usize,
        batch_size: usize,
    ) -> Self {
        Self {
            queue,
            conversations,
            evaluations,
            reviews,
            orchestrator,
            agreement: AgreementCalculator::new(),
            router: ReviewRouter::new(),
            concurrency: concurrency.max(1),
            batch_size: batch_size.max(1),
        }
    }

    /// Run poller and workers until the shutdown signal flips, then
    /// drain outstanding jobs and return.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        tracing::info!(
            concurrency = self.concurrency,
            batch_size = self.batch_size,
            "worker starting"
        );

        let (tx, rx) = mpsc::channel::<QueueEntry>(self.concurrency * 2);
        let rx = Arc::new(Mutex::new(rx));

        let poller = tokio::spawn(Arc::clone(&self).poll_loop(tx, shutdown));

        let mut workers = Vec::with_capacity(self.concurrency);
        for worker_id in 0..self.concurrency {
            let worker = Arc::clone(&self);
            let rx = Arc::clone(&rx);
            workers.push(tokio::spawn(worker.work_loop(worker_id, rx)));
        }

        poller.await.context("poller task")?;
        for handle in workers {
            handle.await.context("worker task")?;
        }

        tracing::info!("worker stopped");
        Ok(())
    }

    /// Fetch entries and forward them to the job channel. Send
    /// blocks when the channel is full, which is the backpressure
    /// bounding in-flight work.
    async fn poll_loop(
        self: Arc<Self>,
        tx: mpsc::Sender<QueueEntry>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            let entries = tokio::select! {
                result = self.queue.consume(self.batch_size, CONSUME_BLOCK) => result,
                _ = shutdown.changed() => break,
            };

            let entries = match entries {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!(error = %e, "error consuming entries, retrying");
                    tokio::time::sleep(QUEUE_RETRY_DELAY).await;
                    continue;
                }
            };

            for entry in entries {
                tokio::select! {
                    sent = tx.send(entry) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }
        }
        // tx drops here; workers drain the channel and exit.
    }

    async fn work_loop(self: Arc<Self>, worker_id: usize, rx: Arc<Mutex<mpsc::Receiver<QueueEntry>>>) {
        loop {
            let entry = { rx.lock().await.recv().await };
            let Some(entry) = entry else { break };

            match self.process_entry(&entry).await {
                Ok(()) => {
                    if let Err(e) = self.queue.ack(std::slice::from_ref(&entry.stream_id)).await {
                        tracing::warn!(
                            worker_id,
                            stream_id = %entry.stream_id,
                            error = %e,
                            "error acking entry"
                        );
                    }
                }
                Err(e) => {
                    // No ack: the entry stays pending and is
                    // redelivered.
                    tracing::warn!(
                        worker_id,
                        conversation_id = %entry.conversation_id,
                        error = %e,
                        "error processing entry"
                    );
                }
            }
        }
    }

    /// One job: decode, evaluate, persist, route, stamp.
    pub(crate) async fn process_entry(&self, entry: &QueueEntry) -> anyhow::Result<()> {
        // Poison messages are logged and considered done: the caller
        // acks them so they cannot wedge the pending set.
        let conv: Conversation = match serde_json::from_str(&entry.payload) {
            Ok(conv) => conv,
            Err(e) => {
                tracing::warn!(
                    stream_id = %entry.stream_id,
                    conversation_id = %entry.conversation_id,
                    error = %e,
                    "undecodable payload, skipping entry"
                );
                return Ok(());
            }
        };

        tracing::info!(conversation_id = %conv.id, "processing conversation");

        // Never errors: failures are recorded inside the aggregate.
        let result = self.orchestrator.evaluate(&conv).await;

        // Every per-evaluator record is stored, failed ones included.
        // Persistence failure means no ack, so the entry redelivers.
        self.evaluations
            .insert_batch(&result.evaluations)
            .context("store evaluations")?;

        tracing::info!(
            conversation_id = %conv.id,
            status = %result.status,
            total_tokens = result.token_usage.total_tokens,
            total_cost_usd = result.token_usage.total_cost,
            successful = result.successful_count,
            expected = result.expected_count,
            "evaluation complete"
        );

        for failure in &result.failed_evaluators {
            tracing::warn!(
                conversation_id = %conv.id,
                evaluator = %failure.evaluator_type,
                retryable = failure.retryable,
                error = %failure.error_message,
                "evaluator failed"
            );
        }

        for (evaluator, usage) in &result.token_usage.by_evaluator {
            tracing::debug!(
                conversation_id = %conv.id,
                evaluator = %evaluator,
                tokens = usage.total_tokens,
                cost_usd = usage.estimated_cost,
                model = usage.model_name.as_deref().unwrap_or("-"),
                "token usage"
            );
        }

        // Annotator agreement, when a panel labeled this conversation.
        // Low agreement forces review routing.
        let mut disagreement = false;
        if let Some(feedback) = &conv.feedback {
            if feedback.annotations.len() >= 2 {
                let metrics = self.agreement.calculate(&feedback.annotations);
                tracing::info!(
                    conversation_id = %conv.id,
                    fleiss_kappa = metrics.fleiss_kappa,
                    percent_agree = metrics.percent_agree,
                    needs_review = metrics.needs_review,
                    "annotator agreement"
                );
                disagreement = metrics.needs_review;
            }
        }

        // Review insertion is best-effort: the evaluation itself is
        // already durable.
        if let Some(decision) = self.router.route(&result, disagreement) {
            tracing::info!(
                conversation_id = %conv.id,
                reason = %decision.reason,
                priority = decision.priority,
                "routing to human review"
            );

            let item = crate::domain::ReviewQueueItem {
                id: String::new(),
                conversation_id: conv.id.clone(),
                evaluation_id: None,
                reason: decision.reason,
                priority: decision.priority,
                status: crate::domain::ReviewStatus::Pending,
                assigned_to: None,
                routing_confidence: decision.routing_confidence,
                created_at: chrono::Utc::now(),
                reviewed_at: None,
                reviewer_notes: None,
            };
            if let Err(e) = self.reviews.add(&item) {
                tracing::warn!(conversation_id = %conv.id, error = %e, "failed to enqueue review");
            }
        }

        self.conversations
            .mark_processed(&conv.id, result.status.as_str())
            .context("mark processed")?;

        tracing::info!(
            conversation_id = %conv.id,
            overall = result.scores.overall,
            issues = result.issues.len(),
            "completed evaluation"
        );

        Ok(())
    }
}
