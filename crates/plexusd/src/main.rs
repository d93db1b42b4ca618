//! plexusd: Plexus relay daemon.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use plexus_core::config::{PlexusConfig, TrustPolicyKind};
use plexus_core::Keypair;
use plexus_services::{ConnectionPool, ProxyContext, RelaySettings, ServerDirectory, SessionRegistry};

mod listener;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = PlexusConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = PlexusConfig::load().context("failed to load config")?;
    tracing::info!(path = %PlexusConfig::file_path().display(), "plexusd starting");

    // Directory
    let directory = ServerDirectory::from_config(&config.directory)
        .context("invalid [directory] configuration")?;
    for server in directory.servers() {
        tracing::info!(name = %server.name, address = %server.address, "backend server");
    }
    match directory.default_server() {
        Some(default) => tracing::info!(name = %default.name, "default server"),
        None => tracing::warn!("no backend servers configured; every login will be refused"),
    }

    // Trust
    if config.trust.policy == TrustPolicyKind::Accept {
        tracing::warn!("trust policy is ACCEPT: login chains are parsed but signatures are NOT verified");
    } else if config.trust.anchors.is_empty() {
        tracing::info!("trust policy is verify, with no anchors configured");
    }

    // Keypair
    let keypair = Arc::new(Keypair::generate());
    tracing::info!(x5u = %keypair.x5u().context("failed to encode proxy key")?, "proxy keypair ready");

    // Shared state
    let pool = ConnectionPool::from_config(&config.pool).context("invalid [pool] configuration")?;
    let ctx = ProxyContext::new(
        directory,
        SessionRegistry::new(),
        pool,
        keypair,
        RelaySettings::from_config(&config),
    );

    tracing::info!(
        bind_ip = %config.pool.bind_ip,
        ports = %format!("{}-{}", config.pool.port_range_start, config.pool.port_range_end),
        "outbound pool ready"
    );

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let upstream = TcpListener::bind(&config.network.bind_address)
        .await
        .with_context(|| format!("failed to bind {}", config.network.bind_address))?;
    tracing::info!(addr = %upstream.local_addr()?, "accepting clients");

    let listener_task = tokio::spawn(
        listener::UpstreamListener::new(upstream, ctx.clone(), shutdown_tx.subscribe()).run(),
    );

    let api_task = {
        let state = plexus_api::ApiState::new(ctx.clone(), shutdown_tx.clone());
        let port = config.network.api_port;
        tokio::spawn(async move {
            if let Err(e) = plexus_api::serve(state, port).await {
                tracing::error!(error = %e, "API server failed");
            }
        })
    };

    let session_printer = {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                tracing::debug!(
                    sessions = ctx.registry.len(),
                    pooled = ctx.pool.active(),
                    "relay snapshot"
                );
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv()  => tracing::info!("shutting down"),
        r = listener_task       => tracing::error!("listener task exited: {:?}", r),
        r = api_task            => tracing::error!("API task exited: {:?}", r),
        r = session_printer     => tracing::error!("session printer exited: {:?}", r),
    }

    let closed = ctx.shutdown();
    // Give leg tasks a moment to flush their disconnect packets.
    tokio::time::sleep(Duration::from_millis(200)).await;
    tracing::info!(sessions = closed, "plexusd stopped");
    Ok(())
}
