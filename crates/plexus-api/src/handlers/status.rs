//! /status and /daemon/shutdown handlers.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use plexus_services::SessionState;

use super::ApiState;

// ── /status ──────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct StatusResponse {
    pub accepting: bool,
    pub uptime_secs: u64,
    pub sessions: SessionCounts,
    pub pool: PoolInfo,
    pub servers: usize,
    pub default_server: Option<String>,
}

#[derive(Serialize, Default)]
pub struct SessionCounts {
    pub total: usize,
    pub handshaking: usize,
    pub relaying: usize,
    pub transferring: usize,
}

#[derive(Serialize)]
pub struct PoolInfo {
    pub active: usize,
    pub shut_down: bool,
}

pub async fn handle_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    let ctx = &state.ctx;

    let mut sessions = SessionCounts::default();
    for session in ctx.registry.snapshot() {
        sessions.total += 1;
        match session.state() {
            SessionState::Handshaking => sessions.handshaking += 1,
            SessionState::Relaying => sessions.relaying += 1,
            SessionState::Transferring => sessions.transferring += 1,
            SessionState::Failed | SessionState::Closed => {}
        }
    }

    Json(StatusResponse {
        accepting: ctx.is_accepting(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        sessions,
        pool: PoolInfo {
            active: ctx.pool.active(),
            shut_down: ctx.pool.is_shut_down(),
        },
        servers: ctx.directory.len(),
        default_server: ctx.directory.default_server().map(|s| s.name.clone()),
    })
}

// ── /daemon/shutdown ──────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ShutdownResponse {
    pub message: String,
}

pub async fn handle_shutdown(State(state): State<ApiState>) -> Json<ShutdownResponse> {
    tracing::info!("shutdown requested via API");
    let _ = state.shutdown_tx.send(());

    Json(ShutdownResponse {
        message: "Shutdown initiated".to_string(),
    })
}
