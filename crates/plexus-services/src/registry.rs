//! Session registry: the one table of active sessions.
//!
//! Keyed by client identity so a second login for the same player is
//! refused while the first is still live. The registry is an ordinary value
//! (cheap to clone, shared through `Arc<DashMap>`), so tests and the daemon
//! each get their own.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Serialize, Serializer};

use crate::error::RelayError;

// ── Keys ──────────────────────────────────────────────────────────────────────

/// A client identity, compared case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ClientIdentity(String);

impl ClientIdentity {
    pub fn new(name: &str) -> Self {
        Self(name.to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 32-byte session id, shown as hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub [u8; 32]);

impl SessionId {
    /// Abbreviated form for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.short())
    }
}

impl FromStr for SessionId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut id = [0u8; 32];
        hex::decode_to_slice(s, &mut id)?;
        Ok(Self(id))
    }
}

impl Serialize for SessionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// Anything the registry can hold.
pub trait Registered {
    fn identity(&self) -> &ClientIdentity;
    fn session_id(&self) -> SessionId;
}

impl<T: Registered> Registered for Arc<T> {
    fn identity(&self) -> &ClientIdentity {
        (**self).identity()
    }

    fn session_id(&self) -> SessionId {
        (**self).session_id()
    }
}

pub struct Registry<T> {
    entries: Arc<DashMap<ClientIdentity, T>>,
}

impl<T> Clone for Registry<T> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
        }
    }
}

impl<T: Registered + Clone> Registry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `value` unless its identity already has a live entry.
    pub fn register(&self, value: T) -> Result<(), RelayError> {
        match self.entries.entry(value.identity().clone()) {
            Entry::Occupied(existing) => Err(RelayError::DuplicateSession(
                existing.key().to_string(),
            )),
            Entry::Vacant(slot) => {
                slot.insert(value);
                Ok(())
            }
        }
    }

    pub fn lookup(&self, identity: &ClientIdentity) -> Option<T> {
        self.entries.get(identity).map(|e| e.value().clone())
    }

    pub fn find(&self, id: &SessionId) -> Option<T> {
        self.entries
            .iter()
            .find(|e| e.value().session_id() == *id)
            .map(|e| e.value().clone())
    }

    /// Remove the entry for `identity` only if it is still session `id`.
    /// A stale teardown never evicts a newer session for the same player.
    pub fn unregister(&self, identity: &ClientIdentity, id: SessionId) -> bool {
        self.entries
            .remove_if(identity, |_, v| v.session_id() == id)
            .is_some()
    }

    pub fn snapshot(&self) -> Vec<T> {
        self.entries.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
