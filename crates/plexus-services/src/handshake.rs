//! Per-leg handshake state machines.
//!
//! Each leg owns one machine and feeds it every packet it reads. `handle`
//! decides from (state, packet id) whether the packet is consumed by the
//! handshake, observed and relayed, or is a protocol violation. The client
//! leg's first packet goes through `UpstreamHandshake::login` instead, since
//! accepting it produces the key and the reply. States only move forward;
//! any error aborts the leg.
//!
//! Downstream (proxy as client):
//!   AwaitingServerHandshake → KeyExchanged → EncryptionEnabled → Established
//!
//! Upstream (proxy as server):
//!   AwaitingLogin → KeyExchanged → EncryptionEnabled → Established

use std::sync::Arc;

use serde::Serialize;

use plexus_core::crypto::{generate_salt, CryptoError, EncryptionContext, Keypair, SymmetricKey};
use plexus_core::token::{
    parse_certificate_chain, server_handshake_token, verify_login_chain, TrustPolicy, VerifiedLogin,
};
use plexus_core::wire::{self, ChangeDimension, LoginPacket, ServerHandshake, StartGame};
use plexus_core::Packet;

use crate::error::RelayError;

/// A handshake phase with a log-friendly name.
pub trait Phase: Copy + Ord {
    fn name(self) -> &'static str;
}

fn advance<S: Phase>(current: &mut S, next: S) -> Result<(), RelayError> {
    if next <= *current {
        return Err(RelayError::UnexpectedPacket {
            packet: "state transition",
            state: current.name(),
        });
    }
    *current = next;
    Ok(())
}

fn unexpected<S: Phase>(packet: &Packet, state: S) -> RelayError {
    RelayError::UnexpectedPacket {
        packet: packet.name(),
        state: state.name(),
    }
}

// ── Downstream ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeState {
    AwaitingServerHandshake,
    KeyExchanged,
    EncryptionEnabled,
    Established,
}

impl Phase for HandshakeState {
    fn name(self) -> &'static str {
        match self {
            HandshakeState::AwaitingServerHandshake => "awaiting_server_handshake",
            HandshakeState::KeyExchanged => "key_exchanged",
            HandshakeState::EncryptionEnabled => "encryption_enabled",
            HandshakeState::Established => "established",
        }
    }
}

#[derive(Debug)]
pub enum DownstreamOutcome {
    /// Install `key` on the backend leg, then write `reply` before anything
    /// else goes out on it.
    EnableEncryption { key: SymmetricKey, reply: Packet },
    /// Start-of-session seen. The packet is still relayed to the client.
    Established { dimension_id: i32 },
    /// Change-dimension seen. The packet is still relayed to the client.
    DimensionChanged { dimension_id: i32 },
    /// Forward to the client untouched.
    Relay,
}

/// The backend-facing side. Runs once per downstream connection; a transfer
/// starts a new one from `AwaitingServerHandshake`.
pub struct DownstreamHandshake {
    keypair: Arc<Keypair>,
    policy: TrustPolicy,
    state: HandshakeState,
}

impl DownstreamHandshake {
    /// `keypair` is the key the proxy presented in its login. Under
    /// `TrustPolicy::Verify` the server-handshake token must be signed by
    /// the key in its own `x5u`.
    pub fn new(keypair: Arc<Keypair>, policy: TrustPolicy) -> Self {
        Self {
            keypair,
            policy,
            state: HandshakeState::AwaitingServerHandshake,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn handle(&mut self, packet: &Packet) -> Result<DownstreamOutcome, RelayError> {
        use HandshakeState::*;

        match (self.state, packet.id()) {
            (AwaitingServerHandshake, wire::SERVER_TO_CLIENT_HANDSHAKE) => {
                let key = self.key_exchange(packet)?;
                advance(&mut self.state, KeyExchanged)?;
                advance(&mut self.state, EncryptionEnabled)?;
                Ok(DownstreamOutcome::EnableEncryption {
                    key,
                    reply: wire::client_handshake_ack(),
                })
            }
            // A backend may refuse the login outright; let the client see why.
            (AwaitingServerHandshake, wire::DISCONNECT) => Ok(DownstreamOutcome::Relay),
            (EncryptionEnabled, wire::START_GAME) => {
                let start = StartGame::decode(packet)?;
                advance(&mut self.state, Established)?;
                Ok(DownstreamOutcome::Established {
                    dimension_id: start.dimension_id,
                })
            }
            (Established, wire::CHANGE_DIMENSION) => {
                let change = ChangeDimension::decode(packet)?;
                Ok(DownstreamOutcome::DimensionChanged {
                    dimension_id: change.dimension_id,
                })
            }
            (EncryptionEnabled | Established, id)
                if id != wire::SERVER_TO_CLIENT_HANDSHAKE && id != wire::LOGIN =>
            {
                Ok(DownstreamOutcome::Relay)
            }
            (state, _) => Err(unexpected(packet, state)),
        }
    }

    fn key_exchange(&self, packet: &Packet) -> Result<SymmetricKey, RelayError> {
        let handshake = ServerHandshake::decode(packet)?;
        let token = parse_certificate_chain(&handshake.token)?;
        let server_key = match self.policy {
            TrustPolicy::Accept => token.issuer_public_key()?,
            TrustPolicy::Verify { .. } => token.verify_self_signed().map_err(|e| match e {
                CryptoError::BadSignature => RelayError::InvalidCertificate(
                    "server handshake is not signed by its x5u key".into(),
                ),
                other => other.into(),
            })?,
        };
        let salt = token.salt()?;
        let context = EncryptionContext::new(&self.keypair, server_key, salt)?;
        Ok(context.into_symmetric_key())
    }
}

// ── Upstream ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamState {
    AwaitingLogin,
    KeyExchanged,
    EncryptionEnabled,
    Established,
}

impl Phase for UpstreamState {
    fn name(self) -> &'static str {
        match self {
            UpstreamState::AwaitingLogin => "awaiting_login",
            UpstreamState::KeyExchanged => "key_exchanged",
            UpstreamState::EncryptionEnabled => "encryption_enabled",
            UpstreamState::Established => "established",
        }
    }
}

/// A login the proxy has accepted.
#[derive(Debug)]
pub struct LoginAccepted {
    pub protocol_version: i32,
    pub login: VerifiedLogin,
    /// Server-handshake packet to send the client in plaintext.
    pub reply: Packet,
    /// Key to enable on the client leg right after `reply` is written.
    pub key: SymmetricKey,
}

#[derive(Debug)]
pub enum UpstreamOutcome {
    /// The client's ack arrived. Consumed; not relayed.
    Established,
    Relay,
}

/// The client-facing side.
pub struct UpstreamHandshake {
    keypair: Arc<Keypair>,
    policy: TrustPolicy,
    state: UpstreamState,
}

impl UpstreamHandshake {
    pub fn new(keypair: Arc<Keypair>, policy: TrustPolicy) -> Self {
        Self {
            keypair,
            policy,
            state: UpstreamState::AwaitingLogin,
        }
    }

    pub fn state(&self) -> UpstreamState {
        self.state
    }

    /// Accept the client's first packet, which must be its login.
    ///
    /// On success the state is already `EncryptionEnabled`: the caller must
    /// write the reply and install the key before reading again.
    pub fn login(&mut self, packet: &Packet) -> Result<LoginAccepted, RelayError> {
        if self.state != UpstreamState::AwaitingLogin || packet.id() != wire::LOGIN {
            return Err(unexpected(packet, self.state));
        }
        let accepted = self.accept_login(packet)?;
        advance(&mut self.state, UpstreamState::KeyExchanged)?;
        advance(&mut self.state, UpstreamState::EncryptionEnabled)?;
        Ok(accepted)
    }

    /// Every packet after the login.
    pub fn handle(&mut self, packet: &Packet) -> Result<UpstreamOutcome, RelayError> {
        use UpstreamState::*;

        match (self.state, packet.id()) {
            (EncryptionEnabled, wire::CLIENT_TO_SERVER_HANDSHAKE) => {
                advance(&mut self.state, Established)?;
                Ok(UpstreamOutcome::Established)
            }
            (Established, id)
                if id != wire::LOGIN && id != wire::CLIENT_TO_SERVER_HANDSHAKE =>
            {
                Ok(UpstreamOutcome::Relay)
            }
            (state, _) => Err(unexpected(packet, state)),
        }
    }

    fn accept_login(&self, packet: &Packet) -> Result<LoginAccepted, RelayError> {
        let login = LoginPacket::decode(packet)?;
        let verified = verify_login_chain(&login.chain, &login.client_data, &self.policy)?;

        let salt = generate_salt();
        let context = EncryptionContext::new(&self.keypair, verified.identity_key, salt.to_vec())?;
        let key = context.into_symmetric_key();

        let token = server_handshake_token(&self.keypair, &salt)?;
        let reply = ServerHandshake {
            token: token.as_str().to_string(),
        }
        .encode();

        Ok(LoginAccepted {
            protocol_version: login.protocol_version,
            login: verified,
            reply,
            key,
        })
    }
}
