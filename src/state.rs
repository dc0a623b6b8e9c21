//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::dashboard::Dashboard;
use crate::sessions::SessionManager;

#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    pub sessions: SessionManager,
    pub dashboard: Dashboard,
}

impl AppState {
    pub fn new(config: Config, sessions: SessionManager) -> Self {
        Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            dashboard: Dashboard::new(sessions.clone()),
            sessions,
        }
    }
}
