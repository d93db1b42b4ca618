//! Plexus relay services: handshakes, sessions, the server directory, the
//! outbound pool and the relay tasks that tie them together.

pub mod connection;
pub mod directory;
pub mod error;
pub mod handshake;
pub mod pending;
pub mod pool;
pub mod registry;
pub mod relay;
pub mod session;

pub use directory::{DirectoryError, ServerDescriptor, ServerDirectory};
pub use error::{Leg, RelayError};
pub use handshake::{DownstreamHandshake, HandshakeState, UpstreamHandshake, UpstreamState};
pub use pool::{ConnectionPool, LeaseInfo, PoolError};
pub use registry::{ClientIdentity, Registry, SessionId};
pub use relay::{
    create_session, refuse_upstream, serve_upstream, transfer_session, ProxyContext, RelaySettings,
};
pub use session::{Session, SessionRegistry, SessionSnapshot, SessionState};
