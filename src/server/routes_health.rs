//! Health and metrics endpoints.
//!
//! `GET /api/v1/health` reports process uptime, database reachability, and
//! the age of the latest monitor sweep — enough for an external prober to
//! tell "serving but stuck" from "healthy". `GET /metrics` renders the
//! Prometheus registry.

use super::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use std::sync::Arc;

pub(super) async fn handler_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let db_ok = tokio::time::timeout(
        std::time::Duration::from_secs(2),
        state.store.health_check(),
    )
    .await
    .map(|r| r.is_ok())
    .unwrap_or(false);

    let last_tick_ago_sec = state
        .last_tick
        .lock()
        .unwrap()
        .map(|at| at.elapsed().as_secs());

    Json(serde_json::json!({
        "status": "ok",
        "uptime_sec": state.started.elapsed().as_secs(),
        "db_ok": db_ok,
        "last_tick_ago_sec": last_tick_ago_sec,
    }))
}

pub(super) async fn handler_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            "content-type",
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        state.metrics.encode(),
    )
}
