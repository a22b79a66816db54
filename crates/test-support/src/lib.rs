#![deny(unsafe_code)]

//! Test doubles for the proxy engine: connections that record what was
//! written to them, connection pools that follow a script and a cluster
//! manager over a fixed set of pools.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::BytesMut;
use codec::{CodecKind, DecodeStatus, MessageType, Metadata};
use proxy::{
    CloseType, ClusterInfo, ClusterManager, ConnectionPool, DownstreamConnection,
    LoadBalancerContext, OutlierResult, PendingConnection, PoolFailureReason, PoolRequest,
    UpstreamConnection, UpstreamTarget,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Parses `addr` or panics.
#[must_use]
pub fn addr(addr: &str) -> SocketAddr {
    addr.parse().expect("valid socket address")
}

/// Decodes every complete message in `bytes`.
#[must_use]
pub fn decode_all(kind: CodecKind, bytes: &[u8], direction: MessageType) -> Vec<Metadata> {
    let mut codec = kind.new_codec();
    let mut buffer = BytesMut::from(bytes);
    let mut decoded = Vec::new();
    while !buffer.is_empty() {
        let mut metadata = Metadata::new(direction);
        match codec.decode(&mut buffer, &mut metadata).expect("decodable bytes") {
            DecodeStatus::Done => decoded.push(metadata),
            DecodeStatus::WaitForData => break,
        }
    }
    decoded
}

#[derive(Debug, Default)]
struct DownstreamState {
    writes: Vec<(BytesMut, bool)>,
    closes: Vec<CloseType>,
}

/// Downstream connection recording writes and closes.
#[derive(Clone, Debug, Default)]
pub struct RecordingDownstream {
    state: Arc<Mutex<DownstreamState>>,
    peer: Option<SocketAddr>,
}

impl RecordingDownstream {
    /// A connection from `peer`.
    #[must_use]
    pub fn with_peer(peer: SocketAddr) -> Self {
        Self {
            state: Arc::default(),
            peer: Some(peer),
        }
    }

    /// Boxed handle sharing this recorder's state.
    #[must_use]
    pub fn boxed(&self) -> Box<dyn DownstreamConnection> {
        Box::new(self.clone())
    }

    /// Everything written so far, concatenated.
    #[must_use]
    pub fn written(&self) -> BytesMut {
        let state = lock(&self.state);
        let mut all = BytesMut::new();
        for (data, _) in &state.writes {
            all.extend_from_slice(data);
        }
        all
    }

    /// Number of writes.
    #[must_use]
    pub fn write_count(&self) -> usize {
        lock(&self.state).writes.len()
    }

    /// Removes and returns the recorded writes.
    pub fn take_writes(&self) -> Vec<BytesMut> {
        lock(&self.state)
            .writes
            .drain(..)
            .map(|(data, _)| data)
            .collect()
    }

    /// Decodes everything written so far as responses.
    #[must_use]
    pub fn responses(&self, kind: CodecKind) -> Vec<Metadata> {
        decode_all(kind, &self.written(), MessageType::Response)
    }

    /// Recorded close calls.
    #[must_use]
    pub fn closes(&self) -> Vec<CloseType> {
        lock(&self.state).closes.clone()
    }
}

impl DownstreamConnection for RecordingDownstream {
    fn write(&mut self, data: BytesMut, end_stream: bool) {
        lock(&self.state).writes.push((data, end_stream));
    }

    fn close(&mut self, close_type: CloseType) {
        lock(&self.state).closes.push(close_type);
    }

    fn is_open(&self) -> bool {
        lock(&self.state).closes.is_empty()
    }

    fn peer_address(&self) -> Option<SocketAddr> {
        self.peer
    }
}

#[derive(Debug, Default)]
struct UpstreamState {
    writes: Vec<BytesMut>,
    closes: Vec<CloseType>,
    callbacks: Vec<UpstreamTarget>,
    released: bool,
}

/// Inspection handle for an upstream connection handed out by a
/// [`ScriptedPool`].
#[derive(Clone, Debug)]
pub struct UpstreamRecord {
    state: Arc<Mutex<UpstreamState>>,
    remote: SocketAddr,
}

impl UpstreamRecord {
    /// Everything written, concatenated.
    #[must_use]
    pub fn written(&self) -> BytesMut {
        let state = lock(&self.state);
        let mut all = BytesMut::new();
        for data in &state.writes {
            all.extend_from_slice(data);
        }
        all
    }

    /// Decodes everything written as requests.
    #[must_use]
    pub fn requests(&self, kind: CodecKind) -> Vec<Metadata> {
        decode_all(kind, &self.written(), MessageType::Request)
    }

    /// Recorded close calls.
    #[must_use]
    pub fn closes(&self) -> Vec<CloseType> {
        lock(&self.state).closes.clone()
    }

    /// Targets registered for data and close events, in order.
    #[must_use]
    pub fn callbacks(&self) -> Vec<UpstreamTarget> {
        lock(&self.state).callbacks.clone()
    }

    /// The handle was dropped without being closed.
    #[must_use]
    pub fn released(&self) -> bool {
        lock(&self.state).released
    }

    /// Address of the fake host.
    #[must_use]
    pub const fn remote(&self) -> SocketAddr {
        self.remote
    }
}

struct RecordingUpstream {
    record: UpstreamRecord,
}

impl UpstreamConnection for RecordingUpstream {
    fn write(&mut self, data: BytesMut, _end_stream: bool) {
        lock(&self.record.state).writes.push(data);
    }

    fn close(&mut self, close_type: CloseType) {
        lock(&self.record.state).closes.push(close_type);
    }

    fn remote_address(&self) -> SocketAddr {
        self.record.remote
    }

    fn add_upstream_callbacks(&mut self, target: UpstreamTarget) {
        lock(&self.record.state).callbacks.push(target);
    }
}

impl Drop for RecordingUpstream {
    fn drop(&mut self) {
        let mut state = lock(&self.record.state);
        if state.closes.is_empty() {
            state.released = true;
        }
    }
}

struct Pending {
    cancelled: Arc<Mutex<usize>>,
}

impl PendingConnection for Pending {
    fn cancel(self: Box<Self>) {
        *lock(&self.cancelled) += 1;
    }
}

/// What a [`ScriptedPool`] answers to the next connection request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PoolStep {
    /// Hand out a connection at once.
    Ready,
    /// Leave the request pending; the test delivers the outcome.
    Pending,
    /// Refuse the request.
    Fail(PoolFailureReason),
}

/// Connection pool that answers from a script. Once the script runs out it
/// keeps answering with its default step.
#[derive(Debug)]
pub struct ScriptedPool {
    host: SocketAddr,
    default_step: PoolStep,
    script: Mutex<VecDeque<PoolStep>>,
    targets: Mutex<Vec<UpstreamTarget>>,
    results: Mutex<Vec<OutlierResult>>,
    connections: Mutex<Vec<UpstreamRecord>>,
    cancelled: Arc<Mutex<usize>>,
}

impl ScriptedPool {
    /// A pool for `host` that answers `default_step`.
    #[must_use]
    pub fn new(host: SocketAddr, default_step: PoolStep) -> Arc<Self> {
        Arc::new(Self {
            host,
            default_step,
            script: Mutex::default(),
            targets: Mutex::default(),
            results: Mutex::default(),
            connections: Mutex::default(),
            cancelled: Arc::default(),
        })
    }

    /// Queues steps used before the default one.
    pub fn script(&self, steps: impl IntoIterator<Item = PoolStep>) {
        lock(&self.script).extend(steps);
    }

    /// A fresh connection to deliver in a pool ready event, with its
    /// inspection handle.
    #[must_use]
    pub fn connection(&self) -> (Box<dyn UpstreamConnection>, UpstreamRecord) {
        let record = UpstreamRecord {
            state: Arc::default(),
            remote: self.host,
        };
        lock(&self.connections).push(record.clone());
        (
            Box::new(RecordingUpstream {
                record: record.clone(),
            }),
            record,
        )
    }

    /// Targets that requested a connection, in order.
    #[must_use]
    pub fn targets(&self) -> Vec<UpstreamTarget> {
        lock(&self.targets).clone()
    }

    /// Outlier results reported so far.
    #[must_use]
    pub fn results(&self) -> Vec<OutlierResult> {
        lock(&self.results).clone()
    }

    /// Connections handed out, in order.
    #[must_use]
    pub fn connections(&self) -> Vec<UpstreamRecord> {
        lock(&self.connections).clone()
    }

    /// Pending requests that were cancelled.
    #[must_use]
    pub fn cancelled(&self) -> usize {
        *lock(&self.cancelled)
    }
}

impl ConnectionPool for ScriptedPool {
    fn host(&self) -> SocketAddr {
        self.host
    }

    fn new_connection(&self, target: UpstreamTarget) -> PoolRequest {
        lock(&self.targets).push(target);
        let step = lock(&self.script)
            .pop_front()
            .unwrap_or(self.default_step);
        match step {
            PoolStep::Ready => PoolRequest::Ready(self.connection().0),
            PoolStep::Pending => PoolRequest::Pending(Box::new(Pending {
                cancelled: Arc::clone(&self.cancelled),
            })),
            PoolStep::Fail(reason) => PoolRequest::Failed(reason),
        }
    }

    fn put_result(&self, result: OutlierResult) {
        lock(&self.results).push(result);
    }
}

/// Cluster manager over a fixed map of single-host clusters.
#[derive(Debug, Default)]
pub struct StaticClusters {
    clusters: HashMap<String, (ClusterInfo, Option<Arc<ScriptedPool>>)>,
    contexts: Mutex<Vec<LoadBalancerContext>>,
}

impl StaticClusters {
    /// No clusters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `name` served by `pool`.
    #[must_use]
    pub fn with_cluster(mut self, name: &str, pool: &Arc<ScriptedPool>) -> Self {
        self.clusters.insert(
            name.to_owned(),
            (
                ClusterInfo {
                    name: name.to_owned(),
                    maintenance_mode: false,
                },
                Some(Arc::clone(pool)),
            ),
        );
        self
    }

    /// Adds `name` with no healthy host.
    #[must_use]
    pub fn with_empty_cluster(mut self, name: &str) -> Self {
        self.clusters.insert(
            name.to_owned(),
            (
                ClusterInfo {
                    name: name.to_owned(),
                    maintenance_mode: false,
                },
                None,
            ),
        );
        self
    }

    /// Adds `name` in maintenance mode.
    #[must_use]
    pub fn with_maintenance_cluster(mut self, name: &str, pool: &Arc<ScriptedPool>) -> Self {
        self.clusters.insert(
            name.to_owned(),
            (
                ClusterInfo {
                    name: name.to_owned(),
                    maintenance_mode: true,
                },
                Some(Arc::clone(pool)),
            ),
        );
        self
    }

    /// Load balancer contexts seen by [`ClusterManager::tcp_conn_pool`].
    #[must_use]
    pub fn contexts(&self) -> Vec<LoadBalancerContext> {
        lock(&self.contexts).clone()
    }
}

impl ClusterManager for StaticClusters {
    fn get(&self, cluster: &str) -> Option<ClusterInfo> {
        self.clusters.get(cluster).map(|(info, _)| info.clone())
    }

    fn tcp_conn_pool(
        &self,
        cluster: &str,
        context: &LoadBalancerContext,
    ) -> Option<Arc<dyn ConnectionPool>> {
        lock(&self.contexts).push(*context);
        let pool = self.clusters.get(cluster)?.1.as_ref()?;
        Some(Arc::clone(pool) as Arc<dyn ConnectionPool>)
    }
}
