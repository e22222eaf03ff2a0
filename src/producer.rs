//! Public HTTP producer: accepts job submissions and enqueues Job Messages.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use tower_http::cors::{Any, CorsLayer};

use crate::error::HpcqError;
use crate::ids::mint_job_id;
use crate::job::JobMessage;
use crate::queue::{Queue, QueueClient};

#[derive(Clone)]
pub struct ProducerState {
    pub api_key: Arc<String>,
    pub queue: Arc<QueueClient>,
}

#[derive(Serialize)]
struct QueuedResponse {
    status: &'static str,
    job_id: String,
    queue: &'static str,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
}

pub fn router(state: ProducerState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/jobs", post(submit_job_handler))
        .route("/health", get(health_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_producer(addr: SocketAddr, state: ProducerState) -> crate::error::Result<()> {
    let app = router(state);
    tracing::info!(addr = %addr, "Starting producer endpoint");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .await
        .map_err(|e| HpcqError::Transport(format!("producer server failed: {e}")))
}

fn authorized(state: &ProducerState, headers: &HeaderMap) -> bool {
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|key| key == state.api_key.as_str())
        .unwrap_or(false)
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, Json(ErrorResponse { error: "unauthorized" })).into_response()
}

pub async fn health_handler(State(state): State<ProducerState>, headers: HeaderMap) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    Json(serde_json::json!({"ok": true})).into_response()
}

/// `POST /jobs`: mint a short job id, wrap the caller's `input`/`metadata`
/// into a Job Message and enqueue it. The queue client absorbs transient
/// 429s; exhaustion surfaces as 429 to the caller with a Retry-After hint.
pub async fn submit_job_handler(
    State(state): State<ProducerState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }

    let parsed: Value = match serde_json::from_str(&body) {
        Ok(Value::Object(map)) => Value::Object(map),
        _ => {
            return (StatusCode::BAD_REQUEST, Json(ErrorResponse { error: "invalid_json" }))
                .into_response();
        }
    };

    let input = parsed.get("input").cloned().unwrap_or(Value::Object(Map::new()));
    let metadata = parsed
        .get("metadata")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    let message = JobMessage {
        job_id: mint_job_id(),
        input,
        created_at: Some(Utc::now()),
        metadata,
    };

    let body = match serde_json::to_value(&message) {
        Ok(v) => v,
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialise job message");
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorResponse { error: "enqueue_failed" }))
                .into_response();
        }
    };

    match state.queue.send(Queue::Jobs, &body).await {
        Ok(()) => {
            tracing::info!(job_id = %message.job_id, "Job queued");
            (
                StatusCode::ACCEPTED,
                Json(QueuedResponse {
                    status: "queued",
                    job_id: message.job_id,
                    queue: "hpc-jobs",
                }),
            )
                .into_response()
        }
        Err(HpcqError::RateLimited { attempts }) => {
            tracing::warn!(attempts, "Enqueue rate limited");
            (
                StatusCode::TOO_MANY_REQUESTS,
                [(axum::http::header::RETRY_AFTER, "2")],
                Json(ErrorResponse { error: "enqueue_rate_limited" }),
            )
                .into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "Enqueue failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorResponse { error: "enqueue_failed" }))
                .into_response()
        }
    }
}
