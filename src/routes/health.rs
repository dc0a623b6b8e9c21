//! Unauthenticated health-check endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::AppState;

/// `GET /api/health`: liveness probe.
///
/// Returns status, uptime, version, live session count and the configured
/// rule chain. No authentication required.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();
    let sessions = state.dashboard.list_sessions().await.len();
    let proxy = &state.config.proxy;

    Json(json!({
        "status": "ok",
        "uptime_secs": uptime,
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": sessions,
        "backend": proxy.backend_url("/"),
        "rules": state.dashboard.rules(),
    }))
}
