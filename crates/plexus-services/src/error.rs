//! Relay error taxonomy.
//!
//! Every failure that ends a leg or a session is one `RelayError`. `kind()`
//! gives the short stable name used in logs and API responses.

use std::fmt;
use std::io;

use plexus_core::cipher::CipherError;
use plexus_core::crypto::CryptoError;
use plexus_core::wire::WireError;
use thiserror::Error;

use crate::directory::DirectoryError;
use crate::pool::PoolError;

/// Which side of a session something happened on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Leg {
    /// Client ↔ proxy.
    Upstream,
    /// Proxy ↔ backend.
    Downstream,
}

impl fmt::Display for Leg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Leg::Upstream => "upstream",
            Leg::Downstream => "downstream",
        })
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("handshake did not complete in time")]
    HandshakeTimeout,

    #[error("unknown server: {0}")]
    UnknownServer(String),

    #[error("no servers configured")]
    NoServersConfigured,

    #[error("a session is already active for {0}")]
    DuplicateSession(String),

    #[error("unexpected {packet} packet in state {state}")]
    UnexpectedPacket { packet: &'static str, state: &'static str },

    #[error("malformed packet: {0}")]
    Malformed(#[from] WireError),

    #[error("cipher failure: {0}")]
    Cipher(#[from] CipherError),

    #[error("bad token: {0}")]
    BadToken(String),

    #[error("token signature does not verify")]
    BadSignature,

    #[error("proxy is not accepting sessions")]
    Rejected,

    #[error("outbound connection failed: {0}")]
    Pool(#[from] PoolError),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("connection closed")]
    Closed,
}

impl RelayError {
    /// Stable short name for logs and the admin API.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::InvalidCertificate(_) => "invalid_certificate",
            RelayError::InvalidKey(_) => "invalid_key",
            RelayError::HandshakeTimeout => "handshake_timeout",
            RelayError::UnknownServer(_) => "unknown_server",
            RelayError::NoServersConfigured => "no_servers_configured",
            RelayError::DuplicateSession(_) => "duplicate_session",
            RelayError::UnexpectedPacket { .. } => "unexpected_packet",
            RelayError::Malformed(_) => "malformed",
            RelayError::Cipher(_) => "cipher",
            RelayError::BadToken(_) => "bad_token",
            RelayError::BadSignature => "bad_signature",
            RelayError::Rejected => "rejected",
            RelayError::Pool(_) | RelayError::Io(_) => "io",
            RelayError::Closed => "closed",
        }
    }

    /// Reason shown to the client in its disconnect screen.
    pub fn disconnect_message(&self) -> String {
        match self {
            RelayError::UnknownServer(_) | RelayError::NoServersConfigured => {
                "No server is available".into()
            }
            RelayError::DuplicateSession(_) => "You are already connected".into(),
            RelayError::HandshakeTimeout => "Timed out connecting to the server".into(),
            RelayError::Rejected => "The proxy is full".into(),
            RelayError::InvalidCertificate(_)
            | RelayError::InvalidKey(_)
            | RelayError::BadToken(_)
            | RelayError::BadSignature => "Authentication failed".into(),
            _ => "Disconnected from the server".into(),
        }
    }
}

impl From<CryptoError> for RelayError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::InvalidCertificate(m) => RelayError::InvalidCertificate(m),
            CryptoError::InvalidKey(m) => RelayError::InvalidKey(m),
            CryptoError::BadSignature => RelayError::BadSignature,
            CryptoError::UntrustedIssuer
            | CryptoError::MalformedToken(_)
            | CryptoError::MissingClaim(_)
            | CryptoError::InvalidSalt(_) => RelayError::BadToken(e.to_string()),
        }
    }
}

impl From<DirectoryError> for RelayError {
    fn from(e: DirectoryError) -> Self {
        match e {
            DirectoryError::UnknownServer(name) => RelayError::UnknownServer(name),
            DirectoryError::NoServersConfigured => RelayError::NoServersConfigured,
            DirectoryError::InvalidAddress { .. } | DirectoryError::DuplicateName(_) => {
                RelayError::UnknownServer(e.to_string())
            }
        }
    }
}
