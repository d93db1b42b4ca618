//! plexus-core: wire format, cryptographic primitives, and configuration.
//! All other Plexus crates depend on this one.

pub mod cipher;
pub mod config;
pub mod crypto;
pub mod token;
pub mod wire;

pub use crypto::{Keypair, SymmetricKey};
pub use wire::Packet;
