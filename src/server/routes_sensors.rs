//! Operator read API — sensors, section status, event history.
//!
//! All three endpoints require the `X-API-Key` header.

use super::{require_api_key, AppState};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;

/// `GET /api/v1/sensors` — every registered sensor with its last heartbeat
/// and freeze state.
pub(super) async fn handler_sensors(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = require_api_key(&state, &headers) {
        return denied;
    }
    let now = state.clock.now_utc();
    match state.store.get_sensors().await {
        Ok(sensors) => {
            let sensors: Vec<_> = sensors
                .into_iter()
                .map(|s| {
                    let heartbeat_age_sec = s
                        .last_heartbeat
                        .map(|last| (now - last).num_seconds().max(0));
                    let frozen = s.frozen(now);
                    serde_json::json!({
                        "uuid": s.uuid,
                        "building_id": s.building_id,
                        "section_id": s.section_id,
                        "comment": s.comment,
                        "is_active": s.is_active,
                        "last_heartbeat": s.last_heartbeat,
                        "heartbeat_age_sec": heartbeat_age_sec,
                        "frozen": frozen,
                        "frozen_until": s.frozen_until,
                        "frozen_is_up": s.frozen_is_up,
                    })
                })
                .collect();
            Json(serde_json::json!({"sensors": sensors})).into_response()
        }
        Err(e) => storage_error(e),
    }
}

/// `GET /api/v1/status` — current per-section power state.
pub(super) async fn handler_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = require_api_key(&state, &headers) {
        return denied;
    }
    match state.store.get_section_states().await {
        Ok(sections) => Json(serde_json::json!({"sections": sections})).into_response(),
        Err(e) => storage_error(e),
    }
}

#[derive(Deserialize)]
pub(super) struct EventsQuery {
    limit: Option<i64>,
}

/// `GET /api/v1/events?limit=` — newest-first slice of the transition log.
pub(super) async fn handler_events(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<EventsQuery>,
) -> Response {
    if let Err(denied) = require_api_key(&state, &headers) {
        return denied;
    }
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    match state.store.get_recent_events(limit).await {
        Ok(events) => Json(serde_json::json!({"events": events})).into_response(),
        Err(e) => storage_error(e),
    }
}

fn storage_error(e: anyhow::Error) -> Response {
    (
        axum::http::StatusCode::SERVICE_UNAVAILABLE,
        Json(serde_json::json!({"error": e.to_string()})),
    )
        .into_response()
}
