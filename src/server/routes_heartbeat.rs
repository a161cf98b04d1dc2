//! Heartbeat ingress — `POST /api/v1/heartbeat`.
//!
//! The single sensor-facing endpoint. Authenticates the shared secret,
//! validates the payload, resolves canonical placement for rollout UUIDs,
//! upserts the sensor row, and pokes the monitor for an opportunistic
//! re-evaluation. Rejections stay off the error log; they only bump the
//! outcome counters.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

use super::{constant_time_eq, AppState};

#[derive(Deserialize)]
pub(super) struct HeartbeatPayload {
    #[serde(default)]
    api_key: String,
    #[serde(default)]
    building_id: i64,
    #[serde(default)]
    sensor_uuid: String,
    section_id: Option<i64>,
    comment: Option<String>,
}

/// Why a heartbeat was turned away. Maps to the HTTP status and the
/// `result` label on the ingress counter.
enum Reject {
    Unauthorized,
    Invalid(&'static str),
    UnknownBuilding(i64),
    RateLimited,
    Busy,
}

impl Reject {
    fn label(&self) -> &'static str {
        match self {
            Reject::Unauthorized => "unauthorized",
            Reject::Invalid(_) => "invalid",
            Reject::UnknownBuilding(_) => "unknown_building",
            Reject::RateLimited => "rate_limited",
            Reject::Busy => "busy",
        }
    }

    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Reject::Unauthorized => (StatusCode::UNAUTHORIZED, "invalid api key".to_string()),
            Reject::Invalid(reason) => (StatusCode::BAD_REQUEST, (*reason).to_string()),
            Reject::UnknownBuilding(id) => {
                (StatusCode::NOT_FOUND, format!("unknown building {}", id))
            }
            Reject::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                "heartbeat rate exceeded".to_string(),
            ),
            Reject::Busy => (
                StatusCode::SERVICE_UNAVAILABLE,
                "storage busy, retry".to_string(),
            ),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

fn valid_uuid(uuid: &str) -> bool {
    !uuid.is_empty()
        && uuid.len() <= 64
        && uuid
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-')
}

pub(super) async fn handler_heartbeat(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<HeartbeatPayload>, JsonRejection>,
) -> Response {
    match try_heartbeat(&state, payload).await {
        Ok(response) => {
            state.metrics.count_heartbeat("accepted");
            response
        }
        Err(reject) => {
            state.metrics.count_heartbeat(reject.label());
            debug!(reason = reject.label(), "heartbeat rejected");
            reject.into_response()
        }
    }
}

async fn try_heartbeat(
    state: &AppState,
    payload: Result<Json<HeartbeatPayload>, JsonRejection>,
) -> Result<Response, Reject> {
    let Json(payload) = payload.map_err(|_| Reject::Invalid("malformed JSON body"))?;

    if !constant_time_eq(
        payload.api_key.as_bytes(),
        state.config.sensor_api_key.as_bytes(),
    ) {
        return Err(Reject::Unauthorized);
    }
    if !valid_uuid(&payload.sensor_uuid) {
        return Err(Reject::Invalid(
            "sensor_uuid must be 1..=64 chars of [a-z0-9_-]",
        ));
    }

    // Rollout sensors are pinned: their request placement is ignored.
    let (building_id, section_id) = match state.canonical.placement(&payload.sensor_uuid) {
        Some(p) => (p.building, p.section),
        None => (payload.building_id, payload.section_id.unwrap_or(1)),
    };

    let building = state
        .store
        .get_building(building_id)
        .await
        .map_err(|_| Reject::Busy)?
        .ok_or(Reject::UnknownBuilding(building_id))?;
    if section_id < 1 || section_id > building.sections_count {
        return Err(Reject::Invalid("section_id out of range"));
    }

    if !state.heartbeat_allowed(&payload.sensor_uuid) {
        return Err(Reject::RateLimited);
    }

    let now = state.clock.now_utc();
    state
        .store
        .record_heartbeat(
            &payload.sensor_uuid,
            building_id,
            section_id,
            payload.comment.as_deref(),
            now,
        )
        .await
        .map_err(|_| Reject::Busy)?;

    // Lossy by design: the periodic tick covers a missed poke.
    state.poke.notify_one();

    Ok((
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ok",
            "timestamp": now,
            "building": building.name,
            "sensor_uuid": payload.sensor_uuid,
        })),
    )
        .into_response())
}
