//! Dashboard HTTP route handlers.
//!
//! All handlers except [`health`] require authentication via the
//! [`crate::auth::require_api_key`] middleware.

pub mod health;
pub mod sessions;

use axum::{http::StatusCode, Json};
use serde_json::{json, Value};

use crate::error::CommandError;

pub type ApiError = (StatusCode, Json<Value>);

pub fn not_found(id: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": format!("Session not found: {id}"), "code": "SESSION_NOT_FOUND"})),
    )
}

impl From<CommandError> for (StatusCode, Json<Value>) {
    fn from(e: CommandError) -> Self {
        match e {
            CommandError::SessionNotFound(id) => not_found(&id),
            CommandError::NotACall => (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": e.to_string(), "code": "NOT_A_CALL"})),
            ),
        }
    }
}
