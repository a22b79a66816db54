//! Pooled TCP connections to upstream hosts.
//!
//! Each open connection is owned by an I/O task. The engine talks to it
//! through a [`TcpUpstream`] handle that forwards commands over a channel;
//! bytes read from the socket go to whichever [`UpstreamTarget`] the current
//! borrower subscribed. Dropping a handle without closing it parks the
//! connection in its [`HostPool`] for the next request.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::BytesMut;
use proxy::{
    CloseType, ConnectionEvent, ConnectionPool, OutlierResult, PendingConnection,
    PoolFailureReason, PoolRequest, UpstreamConnection, UpstreamEvent, UpstreamTarget,
};
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::cluster::EventSink;

const LOG_TARGET: &str = "meta_proxy::upstream";
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Connection and outlier counters of one host.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct HostStatsSnapshot {
    /// Open plus connecting connections.
    pub connections: usize,
    /// Idle connections parked in the pool.
    pub idle: usize,
    /// Successful connects.
    pub connect_success: u64,
    /// Refused or broken connections.
    pub connect_failed: u64,
    /// Connect timeouts.
    pub timeout: u64,
    /// Successful responses.
    pub request_success: u64,
    /// Error responses.
    pub request_failed: u64,
}

#[derive(Debug, Default)]
struct HostStats {
    connect_success: AtomicU64,
    connect_failed: AtomicU64,
    timeout: AtomicU64,
    request_success: AtomicU64,
    request_failed: AtomicU64,
}

#[derive(Debug)]
struct IdleConnection {
    commands: mpsc::UnboundedSender<Command>,
}

/// Connection state for one upstream host, shared by every downstream
/// connection routed to it.
#[derive(Debug)]
pub struct HostPool {
    address: SocketAddr,
    connect_timeout: Duration,
    max_connections: usize,
    connections: AtomicUsize,
    idle: Mutex<Vec<IdleConnection>>,
    stats: HostStats,
}

impl HostPool {
    /// Creates an empty pool for `address`.
    #[must_use]
    pub fn new(address: SocketAddr, connect_timeout: Duration, max_connections: usize) -> Self {
        Self {
            address,
            connect_timeout,
            max_connections,
            connections: AtomicUsize::new(0),
            idle: Mutex::new(Vec::new()),
            stats: HostStats::default(),
        }
    }

    /// Host address.
    #[must_use]
    pub const fn address(&self) -> SocketAddr {
        self.address
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> HostStatsSnapshot {
        let idle = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|entry| !entry.commands.is_closed())
            .count();
        HostStatsSnapshot {
            connections: self.connections.load(Ordering::Relaxed),
            idle,
            connect_success: self.stats.connect_success.load(Ordering::Relaxed),
            connect_failed: self.stats.connect_failed.load(Ordering::Relaxed),
            timeout: self.stats.timeout.load(Ordering::Relaxed),
            request_success: self.stats.request_success.load(Ordering::Relaxed),
            request_failed: self.stats.request_failed.load(Ordering::Relaxed),
        }
    }

    fn take_idle(&self) -> Option<mpsc::UnboundedSender<Command>> {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        while let Some(entry) = idle.pop() {
            if !entry.commands.is_closed() {
                return Some(entry.commands);
            }
        }
        None
    }

    fn park(&self, commands: mpsc::UnboundedSender<Command>) {
        if commands.is_closed() {
            return;
        }
        trace!(target: LOG_TARGET, host = %self.address, "connection returned to pool");
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(IdleConnection { commands });
    }

    fn reserve(self: &Arc<Self>) -> Option<Slot> {
        let reserved = self
            .connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count < self.max_connections).then_some(count + 1)
            })
            .is_ok();
        reserved.then(|| Slot {
            pool: Arc::clone(self),
        })
    }

    fn record(&self, result: OutlierResult) {
        let counter = match result {
            OutlierResult::ConnectSuccess => &self.stats.connect_success,
            OutlierResult::ConnectFailed => &self.stats.connect_failed,
            OutlierResult::Timeout => &self.stats.timeout,
            OutlierResult::RequestSuccess => &self.stats.request_success,
            OutlierResult::RequestFailed => &self.stats.request_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// One unit of a host's connection limit. Released on drop.
#[derive(Debug)]
struct Slot {
    pool: Arc<HostPool>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.pool.connections.fetch_sub(1, Ordering::AcqRel);
    }
}

/// [`ConnectionPool`] handed to one downstream connection's engine.
#[derive(Debug)]
pub struct TcpPool {
    host: Arc<HostPool>,
    events: EventSink,
}

impl TcpPool {
    /// Binds `host` to the event channel of the requesting connection.
    pub const fn new(host: Arc<HostPool>, events: EventSink) -> Self {
        Self { host, events }
    }
}

impl ConnectionPool for TcpPool {
    fn host(&self) -> SocketAddr {
        self.host.address
    }

    fn new_connection(&self, target: UpstreamTarget) -> PoolRequest {
        if let Some(commands) = self.host.take_idle() {
            trace!(target: LOG_TARGET, host = %self.host.address, "reusing idle connection");
            return PoolRequest::Ready(Box::new(TcpUpstream::new(
                Arc::clone(&self.host),
                commands,
                self.events.clone(),
            )));
        }
        let Some(slot) = self.host.reserve() else {
            debug!(target: LOG_TARGET, host = %self.host.address, "connection limit reached");
            return PoolRequest::Failed(PoolFailureReason::Overflow);
        };
        let Ok(runtime) = Handle::try_current() else {
            return PoolRequest::Failed(PoolFailureReason::LocalConnectionFailure);
        };
        let task = runtime.spawn(connect(slot, target, self.events.clone()));
        PoolRequest::Pending(Box::new(PendingConnect { task }))
    }

    fn put_result(&self, result: OutlierResult) {
        trace!(target: LOG_TARGET, host = %self.host.address, ?result, "outlier result");
        self.host.record(result);
    }
}

async fn connect(slot: Slot, target: UpstreamTarget, events: EventSink) {
    let host = Arc::clone(&slot.pool);
    let event = match tokio::time::timeout(host.connect_timeout, TcpStream::connect(host.address))
        .await
    {
        Ok(Ok(stream)) => {
            if let Err(error) = stream.set_nodelay(true) {
                trace!(target: LOG_TARGET, %error, "failed to set TCP_NODELAY");
            }
            debug!(target: LOG_TARGET, host = %host.address, "upstream connected");
            UpstreamEvent::PoolReady(Box::new(TcpUpstream::spawn(slot, stream, events.clone())))
        }
        Ok(Err(error)) => {
            drop(slot);
            debug!(target: LOG_TARGET, host = %host.address, %error, "upstream connect failed");
            UpstreamEvent::PoolFailure(PoolFailureReason::RemoteConnectionFailure)
        }
        Err(_) => {
            drop(slot);
            debug!(target: LOG_TARGET, host = %host.address, "upstream connect timed out");
            UpstreamEvent::PoolFailure(PoolFailureReason::Timeout)
        }
    };
    // A closed receiver drops the event; a ready connection goes back to the pool.
    let _ = events.send((target, event)).await;
}

struct PendingConnect {
    task: JoinHandle<()>,
}

impl PendingConnection for PendingConnect {
    fn cancel(self: Box<Self>) {
        self.task.abort();
    }
}

#[derive(Debug)]
enum Command {
    Write(BytesMut, bool),
    Close(CloseType),
    Subscribe(UpstreamTarget, EventSink),
    Release,
}

/// Borrowed upstream connection.
#[derive(Debug)]
pub struct TcpUpstream {
    pool: Arc<HostPool>,
    commands: mpsc::UnboundedSender<Command>,
    events: EventSink,
    closed: bool,
}

impl TcpUpstream {
    const fn new(
        pool: Arc<HostPool>,
        commands: mpsc::UnboundedSender<Command>,
        events: EventSink,
    ) -> Self {
        Self {
            pool,
            commands,
            events,
            closed: false,
        }
    }

    fn spawn(slot: Slot, stream: TcpStream, events: EventSink) -> Self {
        let pool = Arc::clone(&slot.pool);
        let (commands, receiver) = mpsc::unbounded_channel();
        tokio::spawn(run_connection(slot, stream, receiver));
        Self::new(pool, commands, events)
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            trace!(target: LOG_TARGET, host = %self.pool.address, "connection task gone");
        }
    }
}

impl UpstreamConnection for TcpUpstream {
    fn write(&mut self, data: BytesMut, end_stream: bool) {
        self.send(Command::Write(data, end_stream));
    }

    fn close(&mut self, close_type: CloseType) {
        if !self.closed {
            self.closed = true;
            self.send(Command::Close(close_type));
        }
    }

    fn remote_address(&self) -> SocketAddr {
        self.pool.address
    }

    fn add_upstream_callbacks(&mut self, target: UpstreamTarget) {
        self.send(Command::Subscribe(target, self.events.clone()));
    }
}

impl Drop for TcpUpstream {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.send(Command::Release);
        self.pool.park(self.commands.clone());
    }
}

/// Owns one upstream socket until it closes or every handle is gone.
async fn run_connection(
    slot: Slot,
    stream: TcpStream,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let host = slot.pool.address;
    let (mut reader, mut writer) = stream.into_split();
    let mut subscriber: Option<(UpstreamTarget, EventSink)> = None;
    let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);

    loop {
        tokio::select! {
            biased;
            command = commands.recv() => match command {
                Some(Command::Write(data, end_stream)) => {
                    if let Err(error) = write(&mut writer, &data, end_stream).await {
                        debug!(target: LOG_TARGET, %host, %error, "upstream write failed");
                        notify(subscriber.as_ref(), UpstreamEvent::Connection(ConnectionEvent::RemoteClose)).await;
                        break;
                    }
                }
                Some(Command::Close(close_type)) => {
                    if close_type == CloseType::FlushWrite {
                        let _ = writer.shutdown().await;
                    }
                    trace!(target: LOG_TARGET, %host, ?close_type, "upstream closed locally");
                    break;
                }
                Some(Command::Subscribe(target, sink)) => subscriber = Some((target, sink)),
                Some(Command::Release) => subscriber = None,
                None => break,
            },
            read = reader.read_buf(&mut buffer) => match read {
                Ok(0) | Err(_) => {
                    debug!(target: LOG_TARGET, %host, "upstream closed by peer");
                    notify(subscriber.as_ref(), UpstreamEvent::Connection(ConnectionEvent::RemoteClose)).await;
                    break;
                }
                Ok(read) => {
                    trace!(target: LOG_TARGET, %host, bytes = read, "upstream data");
                    let data = buffer.split();
                    if subscriber.is_none() {
                        debug!(target: LOG_TARGET, %host, bytes = read, "dropping bytes on idle connection");
                    }
                    notify(subscriber.as_ref(), UpstreamEvent::Data { data, end_stream: false }).await;
                    buffer.reserve(READ_BUFFER_SIZE);
                }
            },
        }
    }
    commands.close();
    drop(slot);
}

async fn write(writer: &mut OwnedWriteHalf, data: &[u8], end_stream: bool) -> std::io::Result<()> {
    writer.write_all(data).await?;
    if end_stream {
        writer.shutdown().await?;
    }
    Ok(())
}

async fn notify(subscriber: Option<&(UpstreamTarget, EventSink)>, event: UpstreamEvent) {
    if let Some((target, sink)) = subscriber {
        let _ = sink.send((target.clone(), event)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    fn host(address: SocketAddr, max_connections: usize) -> Arc<HostPool> {
        Arc::new(HostPool::new(
            address,
            Duration::from_secs(2),
            max_connections,
        ))
    }

    async fn next_event(
        events: &mut mpsc::Receiver<(UpstreamTarget, UpstreamEvent)>,
    ) -> (UpstreamTarget, UpstreamEvent) {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event within timeout")
            .expect("channel open")
    }

    #[tokio::test]
    async fn connect_then_reuse_idle_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0_u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
            socket
        });

        let host = host(address, 4);
        let (sink, mut events) = mpsc::channel(16);
        let pool = TcpPool::new(Arc::clone(&host), sink);
        let target = UpstreamTarget::Stream(1);
        assert!(matches!(pool.new_connection(target.clone()), PoolRequest::Pending(_)));

        let (got, event) = next_event(&mut events).await;
        assert_eq!(got, target);
        let UpstreamEvent::PoolReady(mut connection) = event else {
            panic!("expected a ready connection, got {event:?}");
        };
        assert_eq!(connection.remote_address(), address);
        connection.add_upstream_callbacks(target.clone());
        connection.write(BytesMut::from(&b"ping"[..]), false);

        let (_, event) = next_event(&mut events).await;
        let UpstreamEvent::Data { data, end_stream } = event else {
            panic!("expected data, got {event:?}");
        };
        assert_eq!(&data[..], b"ping");
        assert!(!end_stream);

        drop(connection);
        assert_eq!(host.stats().idle, 1);
        assert!(matches!(pool.new_connection(target), PoolRequest::Ready(_)));
        assert_eq!(host.stats().connections, 1);
        drop(accept.await.unwrap());
    }

    #[tokio::test]
    async fn limit_overflows() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let host = host(listener.local_addr().unwrap(), 1);
        let (sink, _events) = mpsc::channel(16);
        let pool = TcpPool::new(host, sink);
        assert!(matches!(
            pool.new_connection(UpstreamTarget::Stream(1)),
            PoolRequest::Pending(_)
        ));
        assert!(matches!(
            pool.new_connection(UpstreamTarget::Stream(2)),
            PoolRequest::Failed(PoolFailureReason::Overflow)
        ));
    }

    #[tokio::test]
    async fn refused_connect_reports_remote_failure() {
        let address = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let host = host(address, 1);
        let (sink, mut events) = mpsc::channel(16);
        let pool = TcpPool::new(Arc::clone(&host), sink);
        let _pending = pool.new_connection(UpstreamTarget::Shadow(3));

        let (_, event) = next_event(&mut events).await;
        assert!(matches!(
            event,
            UpstreamEvent::PoolFailure(PoolFailureReason::RemoteConnectionFailure)
        ));
        assert_eq!(host.stats().connections, 0);
    }

    #[tokio::test]
    async fn peer_close_is_reported_to_the_subscriber() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let (close, closed) = oneshot::channel::<()>();
        let accept = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let _ = closed.await;
            drop(socket);
        });

        let (sink, mut events) = mpsc::channel(16);
        let pool = TcpPool::new(host(address, 1), sink);
        let _pending = pool.new_connection(UpstreamTarget::Stream(8));
        let (_, event) = next_event(&mut events).await;
        let UpstreamEvent::PoolReady(mut connection) = event else {
            panic!("expected a ready connection, got {event:?}");
        };
        connection.add_upstream_callbacks(UpstreamTarget::Stream(8));
        close.send(()).unwrap();
        accept.await.unwrap();

        let (target, event) = next_event(&mut events).await;
        assert_eq!(target, UpstreamTarget::Stream(8));
        assert!(matches!(
            event,
            UpstreamEvent::Connection(ConnectionEvent::RemoteClose)
        ));
    }

    #[test]
    fn outlier_results_are_counted() {
        let host = host("127.0.0.1:1".parse().unwrap(), 1);
        let (sink, _events) = mpsc::channel(16);
        let pool = TcpPool::new(Arc::clone(&host), sink);
        pool.put_result(OutlierResult::RequestSuccess);
        pool.put_result(OutlierResult::RequestFailed);
        pool.put_result(OutlierResult::Timeout);
        let stats = host.stats();
        assert_eq!(
            (stats.request_success, stats.request_failed, stats.timeout),
            (1, 1, 1)
        );
    }

    #[test]
    fn no_runtime_fails_locally() {
        let host = host("127.0.0.1:1".parse().unwrap(), 1);
        let (sink, _events) = mpsc::channel(16);
        let pool = TcpPool::new(Arc::clone(&host), sink);
        assert!(matches!(
            pool.new_connection(UpstreamTarget::Stream(1)),
            PoolRequest::Failed(PoolFailureReason::LocalConnectionFailure)
        ));
        assert_eq!(host.stats().connections, 0);
    }

    #[tokio::test]
    async fn slow_subscriber_receives_every_upstream_byte() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let (subscribed, ready) = oneshot::channel::<()>();
        let accept = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let _ = ready.await;
            for chunk in [&b"one,"[..], b"two,", b"three,", b"four"] {
                socket.write_all(chunk).await.unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            socket
        });

        let (sink, mut events) = mpsc::channel(1);
        let pool = TcpPool::new(host(address, 1), sink);
        let _pending = pool.new_connection(UpstreamTarget::Stream(2));
        let (_, event) = next_event(&mut events).await;
        let UpstreamEvent::PoolReady(mut connection) = event else {
            panic!("expected a ready connection, got {event:?}");
        };
        connection.add_upstream_callbacks(UpstreamTarget::Stream(2));
        subscribed.send(()).unwrap();
        let socket = accept.await.unwrap();

        let mut received = Vec::new();
        while received.len() < b"one,two,three,four".len() {
            let (_, event) = next_event(&mut events).await;
            if let UpstreamEvent::Data { data, .. } = event {
                received.extend_from_slice(&data);
            }
        }
        assert_eq!(received, b"one,two,three,four");
        drop(socket);
    }
}
