//! Freeze control — the deploy-script surface.
//!
//! During firmware flashing or deploys sensors stop beating; freezing pins
//! their contributed state so the aggregator does not declare an outage and
//! spam residents. Bulk freezes stamp every row with one shared `frozen_at`
//! timestamp, and the matching unfreeze lifts only the rows carrying that
//! stamp, so a manual per-sensor freeze placed during the deploy window
//! survives it.
//!
//! All endpoints require `X-API-Key`; the key is checked before the body is
//! interpreted.

use super::{require_api_key, AppState};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

fn bad_body() -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({"error": "malformed JSON body"})),
    )
        .into_response()
}

#[derive(Deserialize)]
pub(super) struct FreezePayload {
    sensor_uuid: String,
    minutes: Option<i64>,
    assumed_is_up: Option<bool>,
}

/// `POST /api/v1/freeze` — pin one sensor for the requested window
/// (default `DEPLOY_FREEZE_MINUTES`).
pub(super) async fn handler_freeze(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<FreezePayload>, JsonRejection>,
) -> Response {
    if let Err(denied) = require_api_key(&state, &headers) {
        return denied;
    }
    let Ok(Json(payload)) = payload else {
        return bad_body();
    };
    let now = state.clock.now_utc();
    let minutes = payload.minutes.unwrap_or(state.config.deploy_freeze_minutes);
    let until = now + chrono::Duration::minutes(minutes);
    let assumed_is_up = payload.assumed_is_up.unwrap_or(true);
    match state
        .store
        .freeze_sensor(&payload.sensor_uuid, until, assumed_is_up, now)
        .await
    {
        Ok(true) => {
            info!(sensor = %payload.sensor_uuid, %until, assumed_is_up, "sensor frozen");
            Json(serde_json::json!({"status": "ok", "frozen_until": until})).into_response()
        }
        Ok(false) => unknown_sensor(&payload.sensor_uuid),
        Err(e) => storage_error(e),
    }
}

#[derive(Deserialize)]
pub(super) struct UnfreezePayload {
    sensor_uuid: String,
}

/// `POST /api/v1/unfreeze` — return one sensor to pure-liveness rules.
pub(super) async fn handler_unfreeze(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<UnfreezePayload>, JsonRejection>,
) -> Response {
    if let Err(denied) = require_api_key(&state, &headers) {
        return denied;
    }
    let Ok(Json(payload)) = payload else {
        return bad_body();
    };
    match state.store.unfreeze_sensor(&payload.sensor_uuid).await {
        Ok(true) => {
            info!(sensor = %payload.sensor_uuid, "sensor unfrozen");
            Json(serde_json::json!({"status": "ok"})).into_response()
        }
        Ok(false) => unknown_sensor(&payload.sensor_uuid),
        Err(e) => storage_error(e),
    }
}

#[derive(Deserialize, Default)]
pub(super) struct FreezeAllPayload {
    minutes: Option<i64>,
    assumed_is_up: Option<bool>,
}

/// `POST /api/v1/freeze_all` — stamp and pin every active sensor. Returns
/// the stamp for the later `unfreeze_stamped`.
pub(super) async fn handler_freeze_all(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<FreezeAllPayload>, JsonRejection>,
) -> Response {
    if let Err(denied) = require_api_key(&state, &headers) {
        return denied;
    }
    // The body is optional for a plain default-window freeze.
    let payload = payload.map(|Json(p)| p).unwrap_or_default();
    let now = state.clock.now_utc();
    let minutes = payload.minutes.unwrap_or(state.config.deploy_freeze_minutes);
    let until = now + chrono::Duration::minutes(minutes);
    let assumed_is_up = payload.assumed_is_up.unwrap_or(true);
    match state.store.freeze_all(until, assumed_is_up, now).await {
        Ok(count) => {
            info!(count, %until, "deploy freeze applied to fleet");
            Json(serde_json::json!({
                "status": "ok",
                "count": count,
                "frozen_at": now,
                "frozen_until": until,
            }))
            .into_response()
        }
        Err(e) => storage_error(e),
    }
}

#[derive(Deserialize)]
pub(super) struct UnfreezeStampedPayload {
    frozen_at: DateTime<Utc>,
}

/// `POST /api/v1/unfreeze_stamped` — lift exactly the rows stamped by one
/// bulk freeze.
pub(super) async fn handler_unfreeze_stamped(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<UnfreezeStampedPayload>, JsonRejection>,
) -> Response {
    if let Err(denied) = require_api_key(&state, &headers) {
        return denied;
    }
    let Ok(Json(payload)) = payload else {
        return bad_body();
    };
    match state.store.unfreeze_stamped(payload.frozen_at).await {
        Ok(count) => {
            info!(count, frozen_at = %payload.frozen_at, "deploy freeze lifted");
            Json(serde_json::json!({"status": "ok", "count": count})).into_response()
        }
        Err(e) => storage_error(e),
    }
}

fn unknown_sensor(uuid: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({"error": format!("unknown sensor {}", uuid)})),
    )
        .into_response()
}

fn storage_error(e: anyhow::Error) -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(serde_json::json!({"error": e.to_string()})),
    )
        .into_response()
}
