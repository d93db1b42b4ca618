//! plexus-ctl: command-line interface for the Plexus relay daemon.

mod cmd;

use anyhow::{Context, Result};

use cmd::servers::cmd_servers;
use cmd::sessions::{cmd_session_drop, cmd_session_inspect, cmd_sessions, cmd_transfer};
use cmd::status::{cmd_shutdown, cmd_status};

const DEFAULT_PORT: u16 = 9101;

fn print_usage() {
    println!("Usage: plexus-ctl [--port <port>] <command>");
    println!();
    println!("Commands:");
    println!("  status                       Show relay status");
    println!("  servers                      List configured backend servers");
    println!("  sessions                     List active sessions");
    println!("  sessions inspect <id>        Show one session in detail");
    println!("  sessions drop <id>           Disconnect a session");
    println!("  transfer <id> <server>       Move a session to another server");
    println!("  shutdown                     Stop the daemon");
    println!();
    println!("Options:");
    println!("  --port <port>   API port (default: {})", DEFAULT_PORT);
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut port = DEFAULT_PORT;
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        if args[i] == "--port" {
            i += 1;
            port = args
                .get(i)
                .context("--port requires a value")?
                .parse()
                .context("--port must be a number")?;
        } else {
            remaining.push(&args[i]);
        }
        i += 1;
    }

    match remaining.as_slice() {
        ["status"] | [] => cmd_status(port).await,
        ["servers"] => cmd_servers(port).await,
        ["sessions"] => cmd_sessions(port).await,
        ["sessions", "inspect", id] => cmd_session_inspect(port, id).await,
        ["sessions", "drop", id] => cmd_session_drop(port, id).await,
        ["transfer", id, server] => cmd_transfer(port, id, server).await,
        ["shutdown"] => cmd_shutdown(port).await,
        ["help"] | ["--help"] | ["-h"] => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
