//! Plexus integration tests.
//!
//! Every test runs a proxy, mock backends and mock clients in-process on
//! loopback, so nothing needs to be running beforehand:
//!
//!   cargo test --test integration

mod infra;

mod admin;
mod failures;
mod relay;
mod transfer;

pub use infra::*;
