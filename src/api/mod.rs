//! HTTP ingest and inspection surface.
//!
//! Thin by design: validation, store calls, queue publish. The
//! pipeline itself lives behind the queue; this surface only feeds
//! and inspects it.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::domain::Conversation;
use crate::queue::Queue;
use crate::storage::{ConversationStore, EvaluationStore, ReviewQueueStore};

/// Hard cap on conversations per ingest request.
const MAX_CONVERSATIONS_PER_REQUEST: usize = 30;

#[derive(Clone)]
pub struct AppState {
    pub conversations: Arc<ConversationStore>,
    pub evaluations: Arc<EvaluationStore>,
    pub reviews: Arc<ReviewQueueStore>,
    pub queue: Arc<dyn Queue>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/conversations", post(ingest))
        .route("/api/v1/conversations/{id}", get(get_conversation))
        .route(
            "/api/v1/conversations/{id}/evaluations",
            get(get_evaluations),
        )
        .route("/api/v1/reviews", get(pending_reviews))
        .route("/api/v1/reviews/{id}/assign", post(assign_review))
        .route("/api/v1/reviews/{id}/complete", post(complete_review))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({"error": message}))).into_response()
}

fn internal_error(err: anyhow::Error) -> Response {
    tracing::error!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "internal error"})),
    )
        .into_response()
}

async fn health(State(state): State<AppState>) -> Response {
    let queue_len = state.queue.len().await.unwrap_or(0);
    Json(json!({"status": "ok", "queue_len": queue_len})).into_response()
}

#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub conversations: Vec<Conversation>,
}

/// Reject a batch before any of it is stored.
fn validate_ingest(req: &IngestRequest) -> Result<(), &'static str> {
    if req.conversations.is_empty() {
        return Err("no conversations provided");
    }
    if req.conversations.len() > MAX_CONVERSATIONS_PER_REQUEST {
        return Err("exceeds maximum batch size of 30");
    }
    for conv in &req.conversations {
        if conv.id.is_empty() {
            return Err("conversation_id is required");
        }
        if conv.agent_version.is_empty() {
            return Err("agent_version is required");
        }
    }
    Ok(())
}

/// Batch ingest: upsert by id, then publish one stream entry per
/// conversation (pipelined).
async fn ingest(State(state): State<AppState>, Json(req): Json<IngestRequest>) -> Response {
    if let Err(message) = validate_ingest(&req) {
        return bad_request(message);
    }

    if let Err(e) = state.conversations.upsert_batch(&req.conversations) {
        return internal_error(e.context("store conversations"));
    }

    if let Err(e) = state.queue.publish_batch(&req.conversations).await {
        return internal_error(e.context("queue conversations"));
    }

    let ids: Vec<&str> = req.conversations.iter().map(|c| c.id.as_str()).collect();
    (
        StatusCode::ACCEPTED,
        Json(json!({"accepted": ids.len(), "ids": ids})),
    )
        .into_response()
}

async fn get_conversation(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.conversations.get(&id) {
        Ok(Some(conv)) => Json(conv).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "conversation not found"})),
        )
            .into_response(),
        Err(e) => internal_error(e),
    }
}

async fn get_evaluations(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.evaluations.get_by_conversation(&id) {
        Ok(evals) => Json(evals).into_response(),
        Err(e) => internal_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct PageParams {
    #[serde(default)]
    limit: usize,
    #[serde(default)]
    offset: usize,
}

async fn pending_reviews(
    State(state): State<AppState>,
    Query(page): Query<PageParams>,
) -> Response {
    match state.reviews.pending(page.limit, page.offset) {
        Ok(items) => {
            let total = state.reviews.count_pending().unwrap_or(items.len() as u64);
            Json(json!({"items": items, "pending_total": total})).into_response()
        }
        Err(e) => internal_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct AssignRequest {
    assigned_to: String,
}

async fn assign_review(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<AssignRequest>,
) -> Response {
    if req.assigned_to.is_empty() {
        return bad_request("assigned_to is required");
    }
    match state.reviews.assign(&id, &req.assigned_to) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => internal_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct CompleteRequest {
    #[serde(default)]
    notes: String,
}

async fn complete_review(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<CompleteRequest>,
) -> Response {
    match state.reviews.complete(&id, &req.notes) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => internal_error(e),
    }
}
