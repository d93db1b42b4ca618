//! Configuration system for Plexus.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $PLEXUS_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/plexus/config.toml
//!   3. ~/.config/plexus/config.toml

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlexusConfig {
    pub network: NetworkConfig,
    pub directory: DirectoryConfig,
    pub pool: PoolConfig,
    pub session: SessionConfig,
    pub trust: TrustConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address clients connect to.
    pub bind_address: String,
    /// Loopback port for the admin API.
    pub api_port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Server new sessions land on. Empty = first server by name.
    pub default_server: String,
    /// Backend name → "host:port".
    pub servers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Local address outbound sockets bind to.
    pub bind_ip: String,
    /// Local port range for outbound sockets. 0..0 = OS-assigned.
    pub port_range_start: u16,
    pub port_range_end: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Deadline for a downstream leg to reach Established.
    pub handshake_timeout_secs: u64,
    /// Upstream packets held while the downstream is not established.
    pub pending_queue_limit: usize,
    /// Concurrent sessions. 0 = unlimited.
    pub max_sessions: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustPolicyKind {
    Accept,
    Verify,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    pub policy: TrustPolicyKind,
    /// Root keys (x5u form) a client chain must be issued by. Empty = any
    /// self-consistent chain.
    pub anchors: Vec<String>,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for PlexusConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            directory: DirectoryConfig::default(),
            pool: PoolConfig::default(),
            session: SessionConfig::default(),
            trust: TrustConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:19132".into(),
            api_port: 9101,
        }
    }
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        let mut servers = BTreeMap::new();
        servers.insert("lobby".to_string(), "127.0.0.1:19133".to_string());
        Self {
            default_server: "lobby".into(),
            servers,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            bind_ip: "0.0.0.0".into(),
            port_range_start: 20000,
            port_range_end: 60000,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: 30,
            pending_queue_limit: 1024,
            max_sessions: 0,
        }
    }
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            policy: TrustPolicyKind::Verify,
            anchors: Vec::new(),
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("plexus")
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl PlexusConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::file_path())
    }

    /// Load from an explicit path, then apply env overrides.
    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
            Self::from_toml(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?
        } else {
            PlexusConfig::default()
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("PLEXUS_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&PlexusConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Reject ranges and limits the daemon cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let (start, end) = (self.pool.port_range_start, self.pool.port_range_end);
        if (start == 0) != (end == 0) || start > end {
            return Err(ConfigError::InvalidValue(
                "pool.port_range",
                format!("{start}..{end}"),
            ));
        }
        if self.session.handshake_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "session.handshake_timeout_secs",
                "0".into(),
            ));
        }
        if self.session.pending_queue_limit == 0 {
            return Err(ConfigError::InvalidValue(
                "session.pending_queue_limit",
                "0".into(),
            ));
        }
        Ok(())
    }

    /// Apply PLEXUS_* env var overrides.
    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`, keyed `PLEXUS_<SECTION>__<KEY>`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(key: &'static str, v: String) -> Result<T, ConfigError> {
            v.parse().map_err(|_| ConfigError::InvalidValue(key, v))
        }

        if let Some(v) = lookup("PLEXUS_NETWORK__BIND_ADDRESS") {
            self.network.bind_address = v;
        }
        if let Some(v) = lookup("PLEXUS_NETWORK__API_PORT") {
            self.network.api_port = parsed("network.api_port", v)?;
        }
        if let Some(v) = lookup("PLEXUS_DIRECTORY__DEFAULT_SERVER") {
            self.directory.default_server = v;
        }
        if let Some(v) = lookup("PLEXUS_POOL__BIND_IP") {
            self.pool.bind_ip = v;
        }
        if let Some(v) = lookup("PLEXUS_POOL__PORT_RANGE_START") {
            self.pool.port_range_start = parsed("pool.port_range_start", v)?;
        }
        if let Some(v) = lookup("PLEXUS_POOL__PORT_RANGE_END") {
            self.pool.port_range_end = parsed("pool.port_range_end", v)?;
        }
        if let Some(v) = lookup("PLEXUS_SESSION__HANDSHAKE_TIMEOUT_SECS") {
            self.session.handshake_timeout_secs = parsed("session.handshake_timeout_secs", v)?;
        }
        if let Some(v) = lookup("PLEXUS_SESSION__PENDING_QUEUE_LIMIT") {
            self.session.pending_queue_limit = parsed("session.pending_queue_limit", v)?;
        }
        if let Some(v) = lookup("PLEXUS_SESSION__MAX_SESSIONS") {
            self.session.max_sessions = parsed("session.max_sessions", v)?;
        }
        if let Some(v) = lookup("PLEXUS_TRUST__POLICY") {
            self.trust.policy = match v.to_ascii_lowercase().as_str() {
                "accept" => TrustPolicyKind::Accept,
                "verify" => TrustPolicyKind::Verify,
                _ => return Err(ConfigError::InvalidValue("trust.policy", v)),
            };
        }
        Ok(())
    }
}
