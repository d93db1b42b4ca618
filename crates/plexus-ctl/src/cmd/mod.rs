//! CLI command modules.

pub mod http;
pub mod servers;
pub mod sessions;
pub mod status;
