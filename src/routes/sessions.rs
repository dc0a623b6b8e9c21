//! REST endpoints for sessions.
//!
//! - `GET    /api/sessions`                  : list live sessions
//! - `GET    /api/sessions/{id}`             : status snapshot
//! - `GET    /api/sessions/{id}/frames?since`: recent frame records
//! - `POST   /api/sessions/{id}/commands`    : send a command to the device
//! - `DELETE /api/sessions/{id}`             : close the session
//! - `DELETE /api/identity/{id}`             : drop cached identity payloads

use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use super::{not_found, ApiError};
use crate::dashboard::Command;
use crate::state::AppState;

/// `GET /api/sessions`
pub async fn list_sessions(State(state): State<AppState>) -> Json<Value> {
    let sessions = state.dashboard.list_sessions().await;
    Json(json!({ "sessions": sessions }))
}

/// `GET /api/sessions/{id}`
pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let snapshot = state
        .dashboard
        .snapshot(&id)
        .await
        .ok_or_else(|| not_found(&id))?;
    Ok(Json(json!(snapshot)))
}

/// Upper bound for `wait_ms`.
const MAX_WAIT_MS: u64 = 30_000;

#[derive(Deserialize)]
pub struct FramesQuery {
    #[serde(default)]
    pub since: u64,
    /// Long-poll: wait this long for a record newer than `since`.
    #[serde(default)]
    pub wait_ms: Option<u64>,
}

/// `GET /api/sessions/{id}/frames?since=N&wait_ms=M`
pub async fn get_frames(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<FramesQuery>,
) -> Result<Json<Value>, ApiError> {
    let page = state
        .dashboard
        .frames(
            &id,
            query.since,
            query
                .wait_ms
                .map(|ms| Duration::from_millis(ms.min(MAX_WAIT_MS))),
        )
        .await
        .ok_or_else(|| not_found(&id))?;
    Ok(Json(json!(page)))
}

/// `POST /api/sessions/{id}/commands`
pub async fn post_command(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(command): Json<Command>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let request_id = state.dashboard.send_command(&id, command).await?;
    info!(session = %id, request_id = %request_id, "dashboard command queued");
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "session_id": id, "request_id": request_id.to_value() })),
    ))
}

/// `DELETE /api/sessions/{id}`
pub async fn close_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if !state.dashboard.close_session(&id).await {
        return Err(not_found(&id));
    }
    info!(session = %id, "session closed from dashboard");
    Ok(Json(json!({ "session_id": id, "status": "closing" })))
}

/// `DELETE /api/identity/{id}`
pub async fn forget_identity(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if !state.dashboard.forget_identity(&id).await {
        return Err((
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("No cached identity for {id}"), "code": "IDENTITY_NOT_FOUND"})),
        ));
    }
    info!(session = %id, "cached identity forgotten");
    Ok(Json(json!({ "session_id": id, "status": "forgotten" })))
}
