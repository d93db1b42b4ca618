//! /servers handler: the configured backend directory.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use super::ApiState;

#[derive(Serialize)]
pub struct ServersResponse {
    pub default_server: Option<String>,
    pub servers: Vec<ServerInfo>,
}

#[derive(Serialize)]
pub struct ServerInfo {
    pub name: String,
    pub address: String,
    /// Live sessions currently routed to this server.
    pub sessions: usize,
}

pub async fn handle_servers(State(state): State<ApiState>) -> Json<ServersResponse> {
    let sessions = state.ctx.registry.snapshot();
    let servers = state
        .ctx
        .directory
        .servers()
        .map(|server| ServerInfo {
            name: server.name.clone(),
            address: server.address.to_string(),
            sessions: sessions
                .iter()
                .filter(|s| s.server().is_some_and(|current| current.name == server.name))
                .count(),
        })
        .collect();

    Json(ServersResponse {
        default_server: state.ctx.directory.default_server().map(|s| s.name.clone()),
        servers,
    })
}
