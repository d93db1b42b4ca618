//! Server directory: the backends sessions can be sent to.
//!
//! Built once from the `[directory]` config table and never mutated.
//! Names match case-insensitively.

use std::collections::BTreeMap;
use std::net::{SocketAddr, ToSocketAddrs};

use serde::Serialize;
use thiserror::Error;

use plexus_core::config::DirectoryConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerDescriptor {
    pub name: String,
    pub address: SocketAddr,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryError {
    #[error("unknown server: {0}")]
    UnknownServer(String),

    #[error("no servers configured")]
    NoServersConfigured,

    #[error("server {name} has unusable address {address}")]
    InvalidAddress { name: String, address: String },

    #[error("server name {0} is listed more than once")]
    DuplicateName(String),
}

#[derive(Debug, Clone, Default)]
pub struct ServerDirectory {
    /// Keyed by lowercased name.
    servers: BTreeMap<String, ServerDescriptor>,
    default: Option<String>,
}

impl ServerDirectory {
    /// Build a directory. `default` names the fallback server; `None` or an
    /// empty name picks the first server by name.
    pub fn new<I>(servers: I, default: Option<&str>) -> Result<Self, DirectoryError>
    where
        I: IntoIterator<Item = ServerDescriptor>,
    {
        let mut map = BTreeMap::new();
        for server in servers {
            let key = server.name.to_lowercase();
            if map.insert(key, server.clone()).is_some() {
                return Err(DirectoryError::DuplicateName(server.name));
            }
        }

        let default = match default.filter(|d| !d.is_empty()) {
            Some(name) => {
                let key = name.to_lowercase();
                if !map.contains_key(&key) {
                    return Err(DirectoryError::UnknownServer(name.to_string()));
                }
                Some(key)
            }
            None => map.keys().next().cloned(),
        };

        Ok(Self {
            servers: map,
            default,
        })
    }

    pub fn from_config(config: &DirectoryConfig) -> Result<Self, DirectoryError> {
        let servers = config
            .servers
            .iter()
            .map(|(name, address)| {
                Ok(ServerDescriptor {
                    name: name.clone(),
                    address: resolve_address(name, address)?,
                })
            })
            .collect::<Result<Vec<_>, DirectoryError>>()?;
        Self::new(servers, Some(config.default_server.as_str()))
    }

    /// Resolve a requested server, falling back to the default when the
    /// name is absent or unknown.
    pub fn resolve(&self, name: Option<&str>) -> Result<&ServerDescriptor, DirectoryError> {
        if let Some(found) = name.and_then(|n| self.servers.get(&n.to_lowercase())) {
            return Ok(found);
        }
        self.default_server().ok_or(DirectoryError::NoServersConfigured)
    }

    /// Exact (case-insensitive) lookup with no fallback.
    pub fn lookup(&self, name: &str) -> Result<&ServerDescriptor, DirectoryError> {
        if self.servers.is_empty() {
            return Err(DirectoryError::NoServersConfigured);
        }
        self.servers
            .get(&name.to_lowercase())
            .ok_or_else(|| DirectoryError::UnknownServer(name.to_string()))
    }

    pub fn default_server(&self) -> Option<&ServerDescriptor> {
        self.default.as_ref().and_then(|k| self.servers.get(k))
    }

    pub fn servers(&self) -> impl Iterator<Item = &ServerDescriptor> {
        self.servers.values()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

fn resolve_address(name: &str, address: &str) -> Result<SocketAddr, DirectoryError> {
    if let Ok(addr) = address.parse() {
        return Ok(addr);
    }
    address
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| DirectoryError::InvalidAddress {
            name: name.to_string(),
            address: address.to_string(),
        })
}
