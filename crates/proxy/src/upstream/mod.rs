//! crates/proxy/src/upstream/mod.rs
//!
//! Interfaces the engine consumes from the network layer: the downstream
//! connection it serves, pooled upstream connections and the cluster manager
//! that hands out pools. Completions are not callbacks; the driver feeds them
//! back through [`ConnectionManager::on_upstream_event`] addressed by an
//! [`UpstreamTarget`].
//!
//! [`ConnectionManager::on_upstream_event`]: crate::ConnectionManager::on_upstream_event

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;

use crate::message::FilterHandle;

mod handler;

pub use handler::{HandlerDelivery, UpstreamHandler, UpstreamHandlerManager};

/// How a connection should be closed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CloseType {
    /// Drop pending writes and close at once.
    NoFlush,
    /// Close after pending writes have been flushed.
    FlushWrite,
}

/// Connection lifecycle notification.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionEvent {
    /// The peer closed the connection.
    RemoteClose,
    /// This side closed the connection.
    LocalClose,
    /// The connection was established.
    Connected,
}

impl ConnectionEvent {
    /// Returns `true` for either close event.
    #[must_use]
    pub const fn is_close(self) -> bool {
        matches!(self, Self::RemoteClose | Self::LocalClose)
    }
}

/// The client connection a [`ConnectionManager`](crate::ConnectionManager)
/// serves.
pub trait DownstreamConnection: Send {
    /// Queues bytes for the peer.
    fn write(&mut self, data: BytesMut, end_stream: bool);

    /// Closes the connection.
    fn close(&mut self, close_type: CloseType);

    /// Returns `false` once the connection is closed or closing.
    fn is_open(&self) -> bool;

    /// Address of the peer, when known.
    fn peer_address(&self) -> Option<SocketAddr>;
}

/// A connection borrowed from a [`ConnectionPool`].
///
/// Dropping the handle returns the connection to its pool unless it was
/// closed first.
pub trait UpstreamConnection: Send {
    /// Queues bytes for the upstream host.
    fn write(&mut self, data: BytesMut, end_stream: bool);

    /// Closes the connection instead of returning it to the pool.
    fn close(&mut self, close_type: CloseType);

    /// Address of the upstream host.
    fn remote_address(&self) -> SocketAddr;

    /// Routes future [`UpstreamEvent::Data`] and [`UpstreamEvent::Connection`]
    /// events of this connection to `target`.
    fn add_upstream_callbacks(&mut self, target: UpstreamTarget);
}

/// A pool request that has not completed yet.
pub trait PendingConnection: Send {
    /// Abandons the request. No event is delivered afterwards.
    fn cancel(self: Box<Self>);
}

/// Outcome of [`ConnectionPool::new_connection`].
pub enum PoolRequest {
    /// The connection is being established; an [`UpstreamEvent::PoolReady`]
    /// or [`UpstreamEvent::PoolFailure`] follows.
    Pending(Box<dyn PendingConnection>),
    /// An idle connection was available.
    Ready(Box<dyn UpstreamConnection>),
    /// The pool refused the request.
    Failed(PoolFailureReason),
}

impl fmt::Debug for PoolRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending(_) => f.write_str("Pending"),
            Self::Ready(connection) => write!(f, "Ready({})", connection.remote_address()),
            Self::Failed(reason) => write!(f, "Failed({reason:?})"),
        }
    }
}

/// Why a pool could not provide a connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PoolFailureReason {
    /// Too many connections or pending requests.
    Overflow,
    /// The connection was closed locally.
    LocalConnectionFailure,
    /// The host refused or dropped the connection.
    RemoteConnectionFailure,
    /// Connecting took too long.
    Timeout,
}

impl PoolFailureReason {
    /// Failures caused by the connection itself, reported asynchronously.
    #[must_use]
    pub const fn is_connection_failure(self) -> bool {
        !matches!(self, Self::Overflow)
    }
}

/// Result reported to a pool's outlier detector.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OutlierResult {
    /// A connection was established.
    ConnectSuccess,
    /// Connecting failed or the connection broke.
    ConnectFailed,
    /// Connecting timed out.
    Timeout,
    /// The host answered successfully.
    RequestSuccess,
    /// The host answered with an error.
    RequestFailed,
}

/// Connections to one upstream host.
pub trait ConnectionPool: Send + Sync {
    /// Host served by the pool.
    fn host(&self) -> SocketAddr;

    /// Requests a connection whose completion is delivered to `target`.
    fn new_connection(&self, target: UpstreamTarget) -> PoolRequest;

    /// Records an outlier detection result for the host.
    fn put_result(&self, result: OutlierResult);
}

/// Cluster attributes the router consults.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClusterInfo {
    /// Cluster name.
    pub name: String,
    /// Requests to a cluster in maintenance mode are rejected.
    pub maintenance_mode: bool,
}

/// Inputs for host selection.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LoadBalancerContext {
    /// Hash computed from the route's hash policy.
    pub hash_key: Option<u64>,
    /// Address of the downstream peer.
    pub downstream: Option<SocketAddr>,
}

/// Source of clusters and their connection pools.
pub trait ClusterManager: Send + Sync {
    /// Looks up a cluster.
    fn get(&self, cluster: &str) -> Option<ClusterInfo>;

    /// Picks a host of `cluster` and returns its pool, or `None` when no host
    /// is available.
    fn tcp_conn_pool(
        &self,
        cluster: &str,
        context: &LoadBalancerContext,
    ) -> Option<Arc<dyn ConnectionPool>>;
}

/// Receiver of an upstream event inside one connection manager.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum UpstreamTarget {
    /// A decoder filter of an in-flight message.
    Filter(FilterHandle),
    /// A shared multiplexed upstream connection, by handler key.
    Handler(String),
    /// A duplex stream, by stream id.
    Stream(u64),
    /// A mirrored request whose response is discarded.
    Shadow(u64),
}

/// Completion delivered to an [`UpstreamTarget`].
pub enum UpstreamEvent {
    /// A pending pool request produced a connection.
    PoolReady(Box<dyn UpstreamConnection>),
    /// A pending pool request failed.
    PoolFailure(PoolFailureReason),
    /// Bytes arrived on the connection.
    Data {
        /// Received bytes.
        data: BytesMut,
        /// The peer finished sending.
        end_stream: bool,
    },
    /// The connection changed state.
    Connection(ConnectionEvent),
}

impl fmt::Debug for UpstreamEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PoolReady(connection) => {
                write!(f, "PoolReady({})", connection.remote_address())
            }
            Self::PoolFailure(reason) => write!(f, "PoolFailure({reason:?})"),
            Self::Data { data, end_stream } => f
                .debug_struct("Data")
                .field("len", &data.len())
                .field("end_stream", end_stream)
                .finish(),
            Self::Connection(event) => write!(f, "Connection({event:?})"),
        }
    }
}
