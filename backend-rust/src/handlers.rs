//! handlers.rs — HTTP routes
//!
//! Bodies arrive as raw bytes and go through `validation` so malformed or
//! invalid input always gets the structured error body.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use ridesafe_types::{AlertRecord, HeartbeatAck, StatusUpdateResponse};
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::state::AppState;
use crate::{now_ms, validation};

// ── Alerts ────────────────────────────────────────────────────────────────────

/// `POST /api/v1/alerts`
pub async fn create_alert(State(state): State<AppState>, body: Bytes) -> Result<(StatusCode, Json<AlertRecord>), ApiError> {
    let now = now_ms();
    let req = validation::create_alert(&validation::parse_json(&body)?, now)?;
    let record = state.dispatch.create_alert(req, now).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// `PATCH /api/v1/alerts/:id/status`
pub async fn update_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<StatusUpdateResponse>, ApiError> {
    let req = validation::status_update(&validation::parse_json(&body)?)?;
    Ok(Json(state.dispatch.update_status(&id, req.status, now_ms()).await?))
}

/// `POST /api/v1/alerts/:id/accept`
pub async fn accept_alert(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<AlertRecord>, ApiError> {
    let req = validation::accept(&validation::parse_json(&body)?)?;
    Ok(Json(state.dispatch.accept(&id, req, now_ms()).await?))
}

// ── Riders ────────────────────────────────────────────────────────────────────

/// `POST /api/v1/riders/heartbeat`
pub async fn rider_heartbeat(State(state): State<AppState>, body: Bytes) -> Result<Json<HeartbeatAck>, ApiError> {
    let now = now_ms();
    let req = validation::heartbeat(&validation::parse_json(&body)?, now)?;
    Ok(Json(state.dispatch.heartbeat(req, now).await?))
}

// ── Misc ──────────────────────────────────────────────────────────────────────

/// Devices use this to estimate their clock offset.
pub async fn time_sync() -> Json<Value> {
    Json(json!({ "serverTime": now_ms() }))
}

pub async fn health() -> &'static str {
    "ok"
}
