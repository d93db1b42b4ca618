//! Sessions: one client, one backend at a time.
//!
//! A `Session` is shared between its two leg tasks, the handshake watchdog
//! and the admin API. The leg tasks own the sockets; the session owns the
//! channels into them plus the relay gate.
//!
//! Downstream legs carry a generation number. A transfer starts a new
//! generation, and anything a superseded leg reports afterwards is ignored,
//! so the old backend going away never tears down the session.
//!
//! Backend packets bound for the client wait in a second gate until the
//! client has acknowledged its own handshake. The session reports
//! `Relaying` only while both legs are established.
//!
//! Lock order: `gate`, `downstream`, `client_gate`, `upstream_state`,
//! `state`. None is held
//! across an await.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use plexus_core::crypto::{derive_session_id, generate_nonce};
use plexus_core::token::ClientProfile;
use plexus_core::Packet;

use crate::directory::ServerDescriptor;
use crate::error::{Leg, RelayError};
use crate::handshake::{HandshakeState, UpstreamState};
use crate::pending::RelayGate;
use crate::registry::{ClientIdentity, Registered, Registry, SessionId};

pub type SessionRegistry = Registry<Arc<Session>>;

/// Instruction to a leg task.
#[derive(Debug)]
pub enum LegCommand {
    /// Write this packet to the peer.
    Send(Packet),
    /// Stop. On the upstream leg a message is sent as a disconnect first.
    Close(Option<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Handshaking,
    Relaying,
    Transferring,
    Failed,
    Closed,
}

struct DownstreamLeg {
    generation: u64,
    server: ServerDescriptor,
    state: HandshakeState,
    tx: mpsc::UnboundedSender<LegCommand>,
}

/// Everything needed to create a session.
pub struct SessionInit {
    pub profile: ClientProfile,
    pub upstream_addr: SocketAddr,
    pub upstream_tx: mpsc::UnboundedSender<LegCommand>,
    /// Re-signed login sent at the start of every downstream connection.
    pub downstream_login: Packet,
    pub pending_limit: usize,
    pub registry: SessionRegistry,
}

pub struct Session {
    id: SessionId,
    identity: ClientIdentity,
    profile: ClientProfile,
    upstream_addr: SocketAddr,
    upstream_tx: mpsc::UnboundedSender<LegCommand>,
    downstream_login: Packet,
    pending_limit: usize,
    gate: Mutex<RelayGate>,
    downstream: Mutex<Option<DownstreamLeg>>,
    client_gate: Mutex<RelayGate>,
    upstream_state: Mutex<UpstreamState>,
    state: Mutex<SessionState>,
    dimension_id: AtomicI32,
    generation: AtomicU64,
    transfers: AtomicU32,
    closed: watch::Sender<bool>,
    registry: SessionRegistry,
    created_at: Instant,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Session {
    pub fn new(init: SessionInit) -> Arc<Self> {
        let identity = ClientIdentity::new(&init.profile.display_name);
        let id = SessionId(derive_session_id(identity.as_str(), &generate_nonce()));
        let (closed, _) = watch::channel(false);
        Arc::new(Self {
            id,
            identity,
            profile: init.profile,
            upstream_addr: init.upstream_addr,
            upstream_tx: init.upstream_tx,
            downstream_login: init.downstream_login,
            pending_limit: init.pending_limit,
            gate: Mutex::new(RelayGate::buffering(init.pending_limit)),
            downstream: Mutex::new(None),
            client_gate: Mutex::new(RelayGate::buffering(init.pending_limit)),
            // A session only exists once its login has been accepted.
            upstream_state: Mutex::new(UpstreamState::EncryptionEnabled),
            state: Mutex::new(SessionState::Handshaking),
            dimension_id: AtomicI32::new(0),
            generation: AtomicU64::new(0),
            transfers: AtomicU32::new(0),
            closed,
            registry: init.registry,
            created_at: Instant::now(),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    pub fn profile(&self) -> &ClientProfile {
        &self.profile
    }

    pub fn downstream_login(&self) -> &Packet {
        &self.downstream_login
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    pub fn dimension_id(&self) -> i32 {
        self.dimension_id.load(Ordering::Relaxed)
    }

    pub fn server(&self) -> Option<ServerDescriptor> {
        lock(&self.downstream).as_ref().map(|leg| leg.server.clone())
    }

    pub fn downstream_state(&self) -> Option<HandshakeState> {
        lock(&self.downstream).as_ref().map(|leg| leg.state)
    }

    pub fn upstream_state(&self) -> UpstreamState {
        *lock(&self.upstream_state)
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the session has been closed.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    // ── Relay ─────────────────────────────────────────────────────────────

    /// Route a client packet to the backend, or hold it until the backend
    /// is established. Overflowing the hold queue fails the session.
    pub fn relay_upstream(&self, packet: Packet) -> Result<(), RelayError> {
        let mut gate = lock(&self.gate);
        match &mut *gate {
            RelayGate::Buffering(queue) => queue.push(packet),
            RelayGate::Open => {
                let downstream = lock(&self.downstream);
                match downstream.as_ref() {
                    Some(leg) => leg
                        .tx
                        .send(LegCommand::Send(packet))
                        .map_err(|_| RelayError::Closed),
                    None => Err(RelayError::Closed),
                }
            }
        }
    }

    /// Send a packet to the client, or hold it until the client has
    /// acknowledged its handshake. Overflowing the hold queue is a
    /// handshake timeout.
    pub fn send_upstream(&self, packet: Packet) -> Result<(), RelayError> {
        match &mut *lock(&self.client_gate) {
            RelayGate::Buffering(queue) => queue.push(packet),
            RelayGate::Open => {
                let _ = self.upstream_tx.send(LegCommand::Send(packet));
                Ok(())
            }
        }
    }

    /// The client acknowledged its handshake. Releases held backend packets
    /// in order and returns how many there were.
    pub fn upstream_established(&self) -> usize {
        let released = {
            let mut client_gate = lock(&self.client_gate);
            let held = client_gate.open();
            let released = held.len();
            for packet in held {
                let _ = self.upstream_tx.send(LegCommand::Send(packet));
            }
            *lock(&self.upstream_state) = UpstreamState::Established;
            released
        };
        self.refresh_state();
        released
    }

    pub fn is_current(&self, generation: u64) -> bool {
        lock(&self.downstream)
            .as_ref()
            .is_some_and(|leg| leg.generation == generation)
    }

    /// Start a new downstream generation against `server`.
    ///
    /// The previous leg, if any, is told to close. Upstream traffic is held
    /// until the new leg reaches `Established`. Returns the generation and
    /// the command channel the new leg task reads.
    pub fn begin_downstream(
        &self,
        server: ServerDescriptor,
    ) -> Result<(u64, mpsc::UnboundedReceiver<LegCommand>), RelayError> {
        let mut gate = lock(&self.gate);
        let mut downstream = lock(&self.downstream);
        if self.is_closed() {
            return Err(RelayError::Closed);
        }

        if gate.is_open() {
            *gate = RelayGate::buffering(self.pending_limit);
        }
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        let previous = downstream.replace(DownstreamLeg {
            generation,
            server,
            state: HandshakeState::AwaitingServerHandshake,
            tx,
        });

        if let Some(old) = previous {
            let _ = old.tx.send(LegCommand::Close(None));
            self.transfers.fetch_add(1, Ordering::Relaxed);
            self.set_state(SessionState::Transferring);
        }
        Ok((generation, rx))
    }

    /// Mirror the downstream handshake state of `generation`.
    pub fn set_downstream_state(&self, generation: u64, state: HandshakeState) {
        if let Some(leg) = lock(&self.downstream).as_mut() {
            if leg.generation == generation {
                leg.state = state;
            }
        }
    }

    /// The backend of `generation` sent start-of-session. Records the
    /// dimension and releases held upstream packets in order. Returns how
    /// many were released, or `None` for a superseded generation.
    pub fn open_relay(&self, generation: u64, dimension_id: i32) -> Option<usize> {
        let mut gate = lock(&self.gate);
        let mut downstream = lock(&self.downstream);
        let leg = downstream.as_mut().filter(|leg| leg.generation == generation)?;

        leg.state = HandshakeState::Established;
        self.dimension_id.store(dimension_id, Ordering::Relaxed);
        let held = gate.open();
        let released = held.len();
        for packet in held {
            let _ = leg.tx.send(LegCommand::Send(packet));
        }
        let server = leg.server.name.clone();
        drop(downstream);
        drop(gate);

        self.refresh_state();
        info!(
            session_id = %self.id.short(),
            identity = %self.identity,
            server = %server,
            dimension_id,
            released,
            "downstream established"
        );
        Some(released)
    }

    pub fn set_dimension(&self, dimension_id: i32) {
        self.dimension_id.store(dimension_id, Ordering::Relaxed);
    }

    /// True when `generation` is still current and either leg has not
    /// finished its handshake. Used by the handshake watchdog.
    pub fn handshake_expired(&self, generation: u64) -> bool {
        let downstream = lock(&self.downstream);
        let Some(leg) = downstream.as_ref().filter(|leg| leg.generation == generation) else {
            return false;
        };
        leg.state != HandshakeState::Established
            || *lock(&self.upstream_state) != UpstreamState::Established
    }

    /// `Relaying` once both legs are established. Holding `downstream`
    /// orders this against `begin_downstream`.
    fn refresh_state(&self) {
        let downstream = lock(&self.downstream);
        let backend_ready = downstream
            .as_ref()
            .is_some_and(|leg| leg.state == HandshakeState::Established);
        if backend_ready && *lock(&self.upstream_state) == UpstreamState::Established {
            self.set_state(SessionState::Relaying);
        }
    }

    // ── Teardown ──────────────────────────────────────────────────────────

    /// Close the session: both legs are told to stop and the registry entry
    /// is removed. Only the first call has any effect.
    pub fn close(&self, leg: Leg, error: Option<&RelayError>) {
        if self.closed.send_replace(true) {
            return;
        }
        self.set_state(if error.is_some() {
            SessionState::Failed
        } else {
            SessionState::Closed
        });

        let message = match (error, leg) {
            (Some(e), _) => Some(e.disconnect_message()),
            (None, Leg::Downstream) => Some("Disconnected from the server".to_string()),
            (None, Leg::Upstream) => None,
        };
        self.shut_legs(message);

        match error {
            Some(e) => warn!(
                session_id = %self.id.short(),
                identity = %self.identity,
                leg = %leg,
                kind = e.kind(),
                error = %e,
                "session failed"
            ),
            None => info!(
                session_id = %self.id.short(),
                identity = %self.identity,
                leg = %leg,
                "session closed"
            ),
        }
    }

    /// Close with an operator-supplied reason, shown to the client.
    pub fn kick(&self, message: &str) {
        if self.closed.send_replace(true) {
            return;
        }
        self.set_state(SessionState::Closed);
        self.shut_legs(Some(message.to_string()));
        info!(
            session_id = %self.id.short(),
            identity = %self.identity,
            reason = message,
            "session closed by proxy"
        );
    }

    fn shut_legs(&self, message: Option<String>) {
        let _ = self.upstream_tx.send(LegCommand::Close(message));
        if let Some(leg) = lock(&self.downstream).take() {
            let _ = leg.tx.send(LegCommand::Close(None));
        }
        self.registry.unregister(&self.identity, self.id);
    }

    fn set_state(&self, next: SessionState) {
        let mut state = lock(&self.state);
        if !matches!(*state, SessionState::Failed | SessionState::Closed) {
            *state = next;
        }
    }

    // ── Admin view ────────────────────────────────────────────────────────

    pub fn snapshot(&self) -> SessionSnapshot {
        let (server, server_address, downstream_state, generation) = {
            let downstream = lock(&self.downstream);
            match downstream.as_ref() {
                Some(leg) => (
                    Some(leg.server.name.clone()),
                    Some(leg.server.address),
                    Some(leg.state),
                    leg.generation,
                ),
                None => (None, None, None, 0),
            }
        };
        SessionSnapshot {
            session_id: self.id,
            identity: self.identity.clone(),
            display_name: self.profile.display_name.clone(),
            xuid: self.profile.xuid.clone(),
            upstream_addr: self.upstream_addr,
            server,
            server_address,
            state: self.state(),
            upstream_state: self.upstream_state(),
            downstream_state,
            generation,
            dimension_id: self.dimension_id(),
            transfers: self.transfers.load(Ordering::Relaxed),
            queued: lock(&self.gate).queued() + lock(&self.client_gate).queued(),
            age_secs: self.created_at.elapsed().as_secs(),
        }
    }
}

impl Registered for Session {
    fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    fn session_id(&self) -> SessionId {
        self.id
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub identity: ClientIdentity,
    pub display_name: String,
    pub xuid: String,
    pub upstream_addr: SocketAddr,
    pub server: Option<String>,
    pub server_address: Option<SocketAddr>,
    pub state: SessionState,
    pub upstream_state: UpstreamState,
    pub downstream_state: Option<HandshakeState>,
    pub generation: u64,
    pub dimension_id: i32,
    pub transfers: u32,
    pub queued: usize,
    pub age_secs: u64,
}
