//! Live downstream connections, for shutdown reporting and per-client counts.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Identifier assigned at accept time.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Numeric value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One accepted connection.
#[derive(Clone, Debug)]
pub struct ConnectionInfo {
    /// Identifier.
    pub id: ConnectionId,
    /// Client address.
    pub peer_addr: SocketAddr,
    /// Accept time.
    pub connected_at: Instant,
}

impl ConnectionInfo {
    /// Time since accept.
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

/// Thread-safe registry of open downstream connections.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, ConnectionInfo>,
    per_ip: DashMap<IpAddr, u32>,
    next_id: AtomicU64,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            per_ip: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Records a freshly accepted connection.
    pub fn register(&self, peer_addr: SocketAddr) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.connections.insert(
            id,
            ConnectionInfo {
                id,
                peer_addr,
                connected_at: Instant::now(),
            },
        );
        *self.per_ip.entry(peer_addr.ip()).or_insert(0) += 1;
        id
    }

    /// Forgets a connection, returning what was recorded for it.
    pub fn unregister(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        let (_, info) = self.connections.remove(&id)?;
        let ip = info.peer_addr.ip();
        let now_empty = self.per_ip.get_mut(&ip).is_some_and(|mut count| {
            *count = count.saturating_sub(1);
            *count == 0
        });
        if now_empty {
            self.per_ip.remove_if(&ip, |_, count| *count == 0);
        }
        Some(info)
    }

    /// Open connections.
    #[must_use]
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Open connections from `ip`.
    #[must_use]
    pub fn connections_from_ip(&self, ip: &IpAddr) -> u32 {
        self.per_ip.get(ip).map_or(0, |count| *count)
    }

    /// Looks up a connection.
    #[must_use]
    pub fn get(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.connections.get(&id).map(|entry| entry.value().clone())
    }

    /// Snapshot of every open connection, oldest first.
    #[must_use]
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let mut all: Vec<_> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        all.sort_by_key(|info| info.id);
        all
    }
}
