//! Admin job endpoints — broadcast enqueue and job inspection.
//!
//! The control plane produces jobs here; the notifier pool consumes them.
//! Both endpoints require `X-API-Key`.

use super::{require_api_key, AppState};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

use crate::db::{BroadcastPayload, KIND_BROADCAST};

#[derive(Deserialize)]
pub(super) struct BroadcastRequest {
    text: String,
    parse_mode: Option<String>,
}

/// `POST /api/v1/broadcast` — enqueue a message for all active
/// subscribers. Returns the job id for progress polling.
pub(super) async fn handler_broadcast(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    request: Result<Json<BroadcastRequest>, JsonRejection>,
) -> Response {
    if let Err(denied) = require_api_key(&state, &headers) {
        return denied;
    }
    let Ok(Json(request)) = request else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "malformed JSON body"})),
        )
            .into_response();
    };
    if request.text.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "broadcast text must not be empty"})),
        )
            .into_response();
    }
    let payload = BroadcastPayload {
        v: 1,
        text: request.text,
        parse_mode: request.parse_mode,
    };
    let raw = match serde_json::to_string(&payload) {
        Ok(raw) => raw,
        Err(e) => return storage_error(e.into()),
    };
    match state
        .store
        .enqueue_job(KIND_BROADCAST, &raw, Some("operator"), state.clock.now_utc())
        .await
    {
        Ok(job_id) => {
            info!(job_id, "broadcast enqueued");
            Json(serde_json::json!({"status": "ok", "job_id": job_id})).into_response()
        }
        Err(e) => storage_error(e),
    }
}

/// `GET /api/v1/jobs/{id}` — inspect one admin job, progress included.
pub(super) async fn handler_job_get(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Response {
    if let Err(denied) = require_api_key(&state, &headers) {
        return denied;
    }
    match state.store.get_job(id).await {
        Ok(Some(job)) => Json(serde_json::json!({"job": job})).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": format!("no job {}", id)})),
        )
            .into_response(),
        Err(e) => storage_error(e),
    }
}

fn storage_error(e: anyhow::Error) -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(serde_json::json!({"error": e.to_string()})),
    )
        .into_response()
}
