//! Inbound client listener.
//!
//! Accepts TCP connections, applies the admission check and hands each
//! accepted connection to its own upstream task.

use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use plexus_services::{refuse_upstream, serve_upstream, ProxyContext};

pub struct UpstreamListener {
    listener: TcpListener,
    ctx: Arc<ProxyContext>,
    shutdown: broadcast::Receiver<()>,
}

impl UpstreamListener {
    pub fn new(
        listener: TcpListener,
        ctx: Arc<ProxyContext>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            listener,
            ctx,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("upstream listener shutting down");
                    return Ok(());
                }

                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(a) => a,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };

                    if !self.ctx.on_connection_request(peer) {
                        let ctx = self.ctx.clone();
                        tokio::spawn(async move { refuse_upstream(&ctx, stream).await });
                        continue;
                    }
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(%peer, error = %e, "set_nodelay failed");
                    }

                    tracing::debug!(%peer, "client connected");
                    let ctx = self.ctx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_upstream(ctx, stream, peer).await {
                            tracing::info!(%peer, kind = e.kind(), error = %e, "client rejected");
                        }
                    });
                }
            }
        }
    }
}
