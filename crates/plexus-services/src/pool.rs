//! Outbound connection pool for downstream legs.
//!
//! Every downstream connection is dialled from a local port drawn from the
//! configured range (0..0 lets the OS choose) and tracked until its lease is
//! dropped. Connections are never reused: one lease per downstream leg, and
//! a transfer takes a fresh one.
//!
//! `shutdown_all` flips a watch flag every lease observes through
//! `Lease::closed`, so the owning tasks drop their streams and the leases
//! remove themselves from the table exactly once.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::Rng;
use thiserror::Error;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::watch;
use tracing::debug;

use plexus_core::config::PoolConfig;

/// Random ports tried before giving up on a busy range.
const BIND_ATTEMPTS: usize = 16;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool is shut down")]
    ShutDown,

    #[error("no free local port after {0} attempts")]
    Exhausted(usize),

    #[error("invalid bind address {0}")]
    InvalidBindIp(String),

    #[error("connect to {remote} failed: {source}")]
    Connect {
        remote: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// What the pool knows about one live connection.
#[derive(Debug, Clone)]
pub struct LeaseInfo {
    pub id: u64,
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub opened_at: Instant,
}

impl LeaseInfo {
    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }
}

type LeaseTable = Arc<DashMap<u64, LeaseInfo>>;

pub struct ConnectionPool {
    bind_ip: IpAddr,
    port_range: (u16, u16),
    leases: LeaseTable,
    next_id: AtomicU64,
    shutdown: watch::Sender<bool>,
}

impl ConnectionPool {
    pub fn new(bind_ip: IpAddr, port_range_start: u16, port_range_end: u16) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            bind_ip,
            port_range: (port_range_start, port_range_end),
            leases: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
            shutdown,
        }
    }

    pub fn from_config(config: &PoolConfig) -> Result<Self, PoolError> {
        let bind_ip = config
            .bind_ip
            .parse()
            .map_err(|_| PoolError::InvalidBindIp(config.bind_ip.clone()))?;
        Ok(Self::new(bind_ip, config.port_range_start, config.port_range_end))
    }

    /// Dial `remote` from a fresh local port and lease the connection.
    pub async fn connect(&self, remote: SocketAddr) -> Result<PooledStream, PoolError> {
        if self.is_shut_down() {
            return Err(PoolError::ShutDown);
        }

        let mut attempts = 0;
        let stream = loop {
            let port = self.pick_port();
            match self.dial(remote, port).await {
                Ok(stream) => break stream,
                Err(e) if e.kind() == io::ErrorKind::AddrInUse && port != 0 => {
                    attempts += 1;
                    if attempts >= BIND_ATTEMPTS {
                        return Err(PoolError::Exhausted(attempts));
                    }
                    debug!(port, "local port busy, retrying");
                }
                Err(source) => return Err(PoolError::Connect { remote, source }),
            }
        };

        let local = stream
            .local_addr()
            .map_err(|source| PoolError::Connect { remote, source })?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.leases.insert(
            id,
            LeaseInfo {
                id,
                local,
                remote,
                opened_at: Instant::now(),
            },
        );
        debug!(lease = id, %local, %remote, "pooled connection opened");

        Ok(PooledStream {
            stream,
            lease: Lease {
                id,
                leases: self.leases.clone(),
                shutdown: self.shutdown.subscribe(),
            },
        })
    }

    /// Signal every lease to close and refuse new connections. Returns the
    /// number of connections that were open.
    pub fn shutdown_all(&self) -> usize {
        self.shutdown.send_replace(true);
        let open = self.leases.len();
        debug!(open, "pool shutting down");
        open
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Number of live leased connections.
    pub fn active(&self) -> usize {
        self.leases.len()
    }

    pub fn leases(&self) -> Vec<LeaseInfo> {
        let mut out: Vec<LeaseInfo> = self.leases.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|l| l.id);
        out
    }

    fn pick_port(&self) -> u16 {
        match self.port_range {
            (0, 0) => 0,
            (start, end) => rand::thread_rng().gen_range(start..=end),
        }
    }

    async fn dial(&self, remote: SocketAddr, port: u16) -> io::Result<TcpStream> {
        let (socket, bind_ip) = match remote {
            SocketAddr::V4(_) => {
                let ip = if self.bind_ip.is_ipv4() {
                    self.bind_ip
                } else {
                    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
                };
                (TcpSocket::new_v4()?, ip)
            }
            SocketAddr::V6(_) => {
                let ip = if self.bind_ip.is_ipv6() {
                    self.bind_ip
                } else {
                    IpAddr::V6(Ipv6Addr::UNSPECIFIED)
                };
                (TcpSocket::new_v6()?, ip)
            }
        };
        socket.bind(SocketAddr::new(bind_ip, port))?;
        let stream = socket.connect(remote).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// A leased outbound connection.
pub struct PooledStream {
    pub stream: TcpStream,
    pub lease: Lease,
}

/// Keeps a pooled connection accounted for. Dropping it releases the entry.
pub struct Lease {
    id: u64,
    leases: LeaseTable,
    shutdown: watch::Receiver<bool>,
}

impl Lease {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Resolves once the pool is shutting down. Cancel-safe.
    pub async fn closed(&mut self) {
        let _ = self.shutdown.wait_for(|down| *down).await;
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.leases.remove(&self.id).is_some() {
            debug!(lease = self.id, "pooled connection released");
        }
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease").field("id", &self.id).finish()
    }
}
