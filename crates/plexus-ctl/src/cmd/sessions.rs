//! Session management commands.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::http::{base_url, delete_json, get_json, post_json_body};

#[derive(Deserialize)]
struct SessionInfo {
    session_id: String,
    identity: String,
    display_name: String,
    xuid: String,
    upstream_addr: String,
    server: Option<String>,
    server_address: Option<String>,
    state: String,
    upstream_state: String,
    downstream_state: Option<String>,
    generation: u64,
    dimension_id: i32,
    transfers: u32,
    queued: usize,
    age_secs: u64,
}

pub async fn cmd_sessions(port: u16) -> Result<()> {
    #[derive(Deserialize)]
    struct SessionsResponse {
        sessions: Vec<SessionInfo>,
    }

    let resp: SessionsResponse = get_json(&format!("{}/sessions", base_url(port))).await?;

    if resp.sessions.is_empty() {
        println!("No active sessions.");
        return Ok(());
    }

    println!("═══════════════════════════════════════");
    println!("  Sessions ({})", resp.sessions.len());
    println!("═══════════════════════════════════════");
    for s in &resp.sessions {
        println!("  ┌─ {}", &s.session_id[..16]);
        println!("  │  player : {} ({})", s.display_name, s.identity);
        println!("  │  server : {}", s.server.as_deref().unwrap_or("-"));
        println!("  │  state  : {}", s.state);
        println!("  └─ age    : {}s", s.age_secs);
    }

    Ok(())
}

pub async fn cmd_session_inspect(port: u16, session_id: &str) -> Result<()> {
    let s: SessionInfo = get_json(&format!("{}/sessions/{}", base_url(port), session_id)).await?;

    println!("═══════════════════════════════════════");
    println!("  Session Details");
    println!("═══════════════════════════════════════");
    println!("  ID         : {}", s.session_id);
    println!("  Player     : {}", s.display_name);
    println!("  Identity   : {}", s.identity);
    println!("  XUID       : {}", s.xuid);
    println!("  Client     : {}", s.upstream_addr);
    println!(
        "  Server     : {} {}",
        s.server.as_deref().unwrap_or("-"),
        s.server_address.as_deref().unwrap_or("")
    );
    println!("  State      : {}", s.state);
    println!("  Upstream   : {}", s.upstream_state);
    println!(
        "  Downstream : {} (generation {})",
        s.downstream_state.as_deref().unwrap_or("-"),
        s.generation
    );
    println!("  Dimension  : {}", s.dimension_id);
    println!("  Transfers  : {}", s.transfers);
    println!("  Held       : {} packet(s)", s.queued);
    println!("  Age        : {}s", s.age_secs);

    Ok(())
}

pub async fn cmd_session_drop(port: u16, session_id: &str) -> Result<()> {
    #[derive(Deserialize)]
    struct DropResponse {
        session_id: String,
        dropped: bool,
    }

    let resp: DropResponse =
        delete_json(&format!("{}/sessions/{}", base_url(port), session_id)).await?;

    if resp.dropped {
        println!("✓ Session dropped: {}...", &resp.session_id[..16]);
    } else {
        println!("Session not found: {}", session_id);
    }

    Ok(())
}

pub async fn cmd_transfer(port: u16, session_id: &str, server: &str) -> Result<()> {
    #[derive(Serialize)]
    struct TransferRequest<'a> {
        server: &'a str,
    }

    #[derive(Deserialize)]
    struct TransferResponse {
        session_id: String,
        server: String,
        address: String,
    }

    let resp: TransferResponse = post_json_body(
        &format!("{}/sessions/{}/transfer", base_url(port), session_id),
        &TransferRequest { server },
    )
    .await?;

    println!(
        "✓ Session {}... transferring to {} ({})",
        &resp.session_id[..16],
        resp.server,
        resp.address
    );
    Ok(())
}
