//! /sessions handlers: session listing, inspection, drop and transfer.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use plexus_services::{transfer_session, RelayError, SessionSnapshot};

use super::{find_session, ApiState};

// ── /sessions ─────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct SessionsResponse {
    pub sessions: Vec<SessionSnapshot>,
}

pub async fn handle_sessions(State(state): State<ApiState>) -> Json<SessionsResponse> {
    let mut sessions: Vec<SessionSnapshot> = state
        .ctx
        .registry
        .snapshot()
        .iter()
        .map(|s| s.snapshot())
        .collect();
    sessions.sort_by(|a, b| a.identity.cmp(&b.identity));
    Json(SessionsResponse { sessions })
}

// ── /sessions/:id (GET) ───────────────────────────────────────────────────────

pub async fn handle_session_inspect(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionSnapshot>, (StatusCode, String)> {
    let session = find_session(&state, &session_id)?;
    Ok(Json(session.snapshot()))
}

// ── /sessions/:id (DELETE) ────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct SessionDropResponse {
    pub session_id: String,
    pub dropped: bool,
}

pub async fn handle_session_drop(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionDropResponse>, (StatusCode, String)> {
    let dropped = match find_session(&state, &session_id) {
        Ok(session) => {
            session.kick("Kicked by an operator");
            tracing::info!(session_id = %session.id().short(), "session dropped via API");
            true
        }
        Err((StatusCode::NOT_FOUND, _)) => false,
        Err(e) => return Err(e),
    };

    Ok(Json(SessionDropResponse {
        session_id,
        dropped,
    }))
}

// ── /sessions/:id/transfer (POST) ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct TransferRequest {
    pub server: String,
}

#[derive(Serialize)]
pub struct TransferResponse {
    pub session_id: String,
    pub server: String,
    pub address: String,
}

pub async fn handle_session_transfer(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
    Json(req): Json<TransferRequest>,
) -> Result<Json<TransferResponse>, (StatusCode, String)> {
    let session = find_session(&state, &session_id)?;

    let server = transfer_session(&state.ctx, &session, &req.server).map_err(|e| {
        let status = match e {
            RelayError::UnknownServer(_) | RelayError::NoServersConfigured => StatusCode::NOT_FOUND,
            RelayError::Closed => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        tracing::warn!(
            session_id = %session.id().short(),
            server = %req.server,
            kind = e.kind(),
            "transfer via API failed"
        );
        (status, e.to_string())
    })?;

    Ok(Json(TransferResponse {
        session_id,
        server: server.name,
        address: server.address.to_string(),
    }))
}
