//! HTTP API handlers: exposes relay state as JSON.

pub mod servers;
pub mod sessions;
pub mod status;

use std::sync::Arc;
use std::time::Instant;

use axum::http::StatusCode;

use plexus_services::{ProxyContext, Session, SessionId};

#[derive(Clone)]
pub struct ApiState {
    pub ctx: Arc<ProxyContext>,
    /// Shutdown broadcast sender: signals graceful daemon shutdown.
    pub shutdown_tx: tokio::sync::broadcast::Sender<()>,
    pub started_at: Instant,
}

impl ApiState {
    pub fn new(ctx: Arc<ProxyContext>, shutdown_tx: tokio::sync::broadcast::Sender<()>) -> Self {
        Self {
            ctx,
            shutdown_tx,
            started_at: Instant::now(),
        }
    }
}

// ── Shared helpers ────────────────────────────────────────────────────────────

/// Parse a hex-encoded 32-byte session id.
fn parse_session_id(hex_str: &str) -> Result<SessionId, (StatusCode, String)> {
    hex_str.parse().map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            "session_id must be 64 hex characters".to_string(),
        )
    })
}

/// Look up a live session by its hex id.
fn find_session(state: &ApiState, hex_str: &str) -> Result<Arc<Session>, (StatusCode, String)> {
    let id = parse_session_id(hex_str)?;
    state
        .ctx
        .registry
        .find(&id)
        .ok_or((StatusCode::NOT_FOUND, "session not found".to_string()))
}

// Re-export handler functions for use in router setup.
pub use servers::handle_servers;
pub use sessions::{
    handle_session_drop, handle_session_inspect, handle_session_transfer, handle_sessions,
};
pub use status::{handle_shutdown, handle_status};
