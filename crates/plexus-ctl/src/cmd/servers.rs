//! Backend directory listing.

use anyhow::Result;
use serde::Deserialize;

use super::http::{base_url, get_json};

#[derive(Deserialize)]
struct ServersResponse {
    default_server: Option<String>,
    servers: Vec<ServerInfo>,
}

#[derive(Deserialize)]
struct ServerInfo {
    name: String,
    address: String,
    sessions: usize,
}

pub async fn cmd_servers(port: u16) -> Result<()> {
    let resp: ServersResponse = get_json(&format!("{}/servers", base_url(port))).await?;

    if resp.servers.is_empty() {
        println!("No servers configured.");
        return Ok(());
    }

    println!("═══════════════════════════════════════");
    println!("  Servers ({})", resp.servers.len());
    println!("═══════════════════════════════════════");
    for s in &resp.servers {
        let marker = if resp.default_server.as_deref() == Some(s.name.as_str()) {
            " (default)"
        } else {
            ""
        };
        println!("  {:<16} {:<22} {} session(s){}", s.name, s.address, s.sessions, marker);
    }

    Ok(())
}
