//! Daemon status and shutdown commands.

use anyhow::Result;
use serde::Deserialize;

use super::http::{base_url, get_json, post_json};

#[derive(Deserialize)]
struct StatusResponse {
    accepting: bool,
    uptime_secs: u64,
    sessions: SessionCounts,
    pool: PoolInfo,
    servers: usize,
    default_server: Option<String>,
}

#[derive(Deserialize)]
struct SessionCounts {
    total: usize,
    handshaking: usize,
    relaying: usize,
    transferring: usize,
}

#[derive(Deserialize)]
struct PoolInfo {
    active: usize,
    shut_down: bool,
}

pub async fn cmd_status(port: u16) -> Result<()> {
    let resp: StatusResponse = get_json(&format!("{}/status", base_url(port))).await?;

    println!("═══════════════════════════════════════");
    println!("  Plexus Relay Status");
    println!("═══════════════════════════════════════");
    println!(
        "  Accepting        : {}",
        if resp.accepting { "yes" } else { "no (shutting down)" }
    );
    println!("  Uptime           : {}s", resp.uptime_secs);
    println!("  Sessions         : {}", resp.sessions.total);
    println!("    handshaking    : {}", resp.sessions.handshaking);
    println!("    relaying       : {}", resp.sessions.relaying);
    println!("    transferring   : {}", resp.sessions.transferring);
    println!(
        "  Pooled sockets   : {}{}",
        resp.pool.active,
        if resp.pool.shut_down { " (pool shut down)" } else { "" }
    );
    println!("  Servers          : {}", resp.servers);
    println!(
        "  Default server   : {}",
        resp.default_server.as_deref().unwrap_or("-")
    );

    Ok(())
}

pub async fn cmd_shutdown(port: u16) -> Result<()> {
    #[derive(Deserialize)]
    struct ShutdownResponse {
        message: String,
    }

    let resp: ShutdownResponse =
        post_json(&format!("{}/daemon/shutdown", base_url(port))).await?;
    println!("{}", resp.message);
    Ok(())
}
