//! Relay orchestration: admission, session creation, downstream dialling,
//! the handshake watchdog and transfers.
//!
//! `ProxyContext` is the shared state every connection task gets a handle
//! to. `upstream::serve_upstream` drives a client connection from login to
//! close; `downstream::run_downstream` drives one backend connection.

pub mod downstream;
pub mod upstream;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use plexus_core::config::PlexusConfig;
use plexus_core::token::TrustPolicy;
use plexus_core::Keypair;

use crate::directory::{ServerDescriptor, ServerDirectory};
use crate::error::{Leg, RelayError};
use crate::pool::ConnectionPool;
use crate::session::{Session, SessionInit, SessionRegistry};

pub use upstream::{refuse_upstream, serve_upstream};

/// Disconnect reason for sessions closed by a proxy shutdown.
pub const SHUTDOWN_MESSAGE: &str = "Proxy is shutting down";

/// Tunables for every session.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub handshake_timeout: Duration,
    pub pending_limit: usize,
    /// 0 = unlimited.
    pub max_sessions: usize,
    pub trust: TrustPolicy,
}

impl RelaySettings {
    pub fn from_config(config: &PlexusConfig) -> Self {
        Self {
            handshake_timeout: Duration::from_secs(config.session.handshake_timeout_secs),
            pending_limit: config.session.pending_queue_limit,
            max_sessions: config.session.max_sessions,
            trust: TrustPolicy::from(&config.trust),
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self::from_config(&PlexusConfig::default())
    }
}

pub struct ProxyContext {
    pub directory: Arc<ServerDirectory>,
    pub registry: SessionRegistry,
    pub pool: Arc<ConnectionPool>,
    pub keypair: Arc<Keypair>,
    pub settings: RelaySettings,
    accepting: AtomicBool,
}

impl ProxyContext {
    pub fn new(
        directory: ServerDirectory,
        registry: SessionRegistry,
        pool: ConnectionPool,
        keypair: Arc<Keypair>,
        settings: RelaySettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            directory: Arc::new(directory),
            registry,
            pool: Arc::new(pool),
            keypair,
            settings,
            accepting: AtomicBool::new(true),
        })
    }

    /// Admission check for a new inbound connection.
    pub fn on_connection_request(&self, addr: SocketAddr) -> bool {
        if !self.accepting.load(Ordering::Relaxed) {
            debug!(%addr, "rejecting connection: shutting down");
            return false;
        }
        let max = self.settings.max_sessions;
        if max > 0 && self.registry.len() >= max {
            warn!(%addr, max_sessions = max, "rejecting connection: session limit reached");
            return false;
        }
        true
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Relaxed)
    }

    /// Stop admitting, close every session and every pooled connection.
    /// Returns the number of sessions that were closed.
    pub fn shutdown(&self) -> usize {
        self.accepting.store(false, Ordering::Relaxed);
        let sessions = self.registry.snapshot();
        for session in &sessions {
            session.kick(SHUTDOWN_MESSAGE);
        }
        let pooled = self.pool.shutdown_all();
        info!(sessions = sessions.len(), pooled, "relay shut down");
        sessions.len()
    }
}

/// Register a new session and start its first downstream leg.
///
/// `requested` picks the backend; unknown or absent names go to the
/// directory default.
pub fn create_session(
    ctx: &Arc<ProxyContext>,
    init: SessionInit,
    requested: Option<&str>,
) -> Result<Arc<Session>, RelayError> {
    let server = ctx.directory.resolve(requested)?.clone();
    // Admission ran when the socket was accepted; logins that were still in
    // flight then are counted here.
    let max = ctx.settings.max_sessions;
    if max > 0 && ctx.registry.len() >= max {
        return Err(RelayError::Rejected);
    }
    let session = Session::new(init);
    ctx.registry.register(session.clone())?;
    info!(
        session_id = %session.id().short(),
        identity = %session.identity(),
        server = %server.name,
        "session created"
    );

    if let Err(e) = start_downstream(ctx, &session, server) {
        session.close(Leg::Downstream, Some(&e));
        return Err(e);
    }
    Ok(session)
}

/// Move `session` to the backend called `name`.
///
/// An unknown name fails before anything is touched. Otherwise the current
/// backend connection is closed and a new one handshakes from scratch; the
/// client connection and session id stay as they are.
pub fn transfer_session(
    ctx: &Arc<ProxyContext>,
    session: &Arc<Session>,
    name: &str,
) -> Result<ServerDescriptor, RelayError> {
    let server = ctx.directory.lookup(name)?.clone();
    info!(
        session_id = %session.id().short(),
        identity = %session.identity(),
        from = %session.server().map(|s| s.name).unwrap_or_default(),
        to = %server.name,
        "transferring session"
    );
    start_downstream(ctx, session, server.clone())?;
    Ok(server)
}

/// Open a new downstream generation: dial through the pool, run the leg,
/// and arm the handshake watchdog.
fn start_downstream(
    ctx: &Arc<ProxyContext>,
    session: &Arc<Session>,
    server: ServerDescriptor,
) -> Result<(), RelayError> {
    let address = server.address;
    let (generation, commands) = session.begin_downstream(server)?;

    {
        let ctx = ctx.clone();
        let session = session.clone();
        tokio::spawn(async move {
            match ctx.pool.connect(address).await {
                Ok(pooled) => {
                    downstream::run_downstream(
                        session,
                        pooled,
                        generation,
                        commands,
                        ctx.keypair.clone(),
                        ctx.settings.trust.clone(),
                    )
                    .await
                }
                Err(e) => {
                    if session.is_current(generation) {
                        let err = RelayError::from(e);
                        session.close(Leg::Downstream, Some(&err));
                    }
                }
            }
        });
    }

    spawn_watchdog(session.clone(), generation, ctx.settings.handshake_timeout);
    Ok(())
}

/// Fail the session if downstream `generation`, or the client leg, is not
/// established by `deadline`.
fn spawn_watchdog(session: Arc<Session>, generation: u64, deadline: Duration) {
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(deadline) => {
                if session.handshake_expired(generation) {
                    session.close(Leg::Downstream, Some(&RelayError::HandshakeTimeout));
                }
            }
            _ = session.closed() => {}
        }
    });
}
