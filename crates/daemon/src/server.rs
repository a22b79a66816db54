//! Listener and per-connection event loop.
//!
//! [`Server::bind`] compiles the configuration once: routes, clusters, rate
//! limiters and stats are shared by every connection. Each accepted socket
//! gets its own [`ConnectionManager`] driven by a task that multiplexes
//! socket reads, upstream completions, the idle timer and shutdown.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::BytesMut;
use codec::CodecKind;
use proxy::{
    ClusterManager, ConnectionEvent, ConnectionManager, FilterConfig, LocalRateLimitFactory,
    ProxyConfig, ProxyStats, RouteTable, RouterFactory,
};
use ratelimit::LocalRateLimiter;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Semaphore, broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cluster::{Clusters, ConnectionClusters, UPSTREAM_EVENT_CAPACITY};
use crate::config::DaemonConfig;
use crate::downstream::TcpDownstream;
use crate::error::DaemonError;
use crate::registry::ConnectionRegistry;

const LOG_TARGET: &str = "meta_proxy::server";
const READ_BUFFER_SIZE: usize = 16 * 1024;

enum ChainEntry {
    RateLimit(Arc<LocalRateLimiter>),
    Router { multiplexing: bool },
}

/// Everything a connection needs to build its engine configuration.
struct ListenerState {
    codec: CodecKind,
    stat_prefix: String,
    idle_timeout: Option<std::time::Duration>,
    routes: RouteTable,
    chain: Vec<ChainEntry>,
    clusters: Arc<Clusters>,
    stats: Arc<ProxyStats>,
}

impl ListenerState {
    fn from_config(config: &DaemonConfig) -> Result<Self, DaemonError> {
        let routes = RouteTable::from_config(&config.route_config)?;
        let clusters = Arc::new(Clusters::from_configs(&config.clusters)?);
        let mut chain = Vec::with_capacity(config.filters.len());
        for filter in &config.filters {
            chain.push(match filter {
                FilterConfig::LocalRatelimit(limit) => ChainEntry::RateLimit(Arc::new(
                    LocalRateLimiter::new(limit.clone()).map_err(proxy::ProxyError::from)?,
                )),
                FilterConfig::Router(router) => ChainEntry::Router {
                    multiplexing: router.multiplexing,
                },
            });
        }
        Ok(Self {
            codec: config.codec,
            stat_prefix: config.stat_prefix.clone(),
            idle_timeout: config.idle_timeout(),
            routes,
            chain,
            clusters,
            stats: Arc::new(ProxyStats::new()),
        })
    }

    fn limiters(&self) -> impl Iterator<Item = &Arc<LocalRateLimiter>> {
        self.chain.iter().filter_map(|entry| match entry {
            ChainEntry::RateLimit(limiter) => Some(limiter),
            ChainEntry::Router { .. } => None,
        })
    }

    fn connection_config(&self, clusters: Arc<dyn ClusterManager>) -> ProxyConfig {
        let mut builder = ProxyConfig::builder(self.codec)
            .stat_prefix(self.stat_prefix.clone())
            .route_table(self.routes.clone())
            .idle_timeout(self.idle_timeout)
            .stats(Arc::clone(&self.stats));
        for entry in &self.chain {
            builder = match entry {
                ChainEntry::RateLimit(limiter) => {
                    builder.rate_limit(LocalRateLimitFactory::from_limiter(Arc::clone(limiter)))
                }
                ChainEntry::Router { multiplexing } => builder.filter(Arc::new(
                    RouterFactory::new(Arc::clone(&clusters), *multiplexing),
                )),
            };
        }
        builder.build()
    }
}

/// Handle that stops a running [`Server`].
#[derive(Clone, Debug)]
pub struct ShutdownHandle {
    sender: broadcast::Sender<()>,
}

impl ShutdownHandle {
    /// Stops accepting and closes every open connection.
    pub fn shutdown(&self) {
        let _ = self.sender.send(());
    }
}

/// Bound listener.
pub struct Server {
    listener: TcpListener,
    state: Arc<ListenerState>,
    registry: Arc<ConnectionRegistry>,
    permits: Arc<Semaphore>,
    shutdown: broadcast::Sender<()>,
}

impl Server {
    /// Compiles `config` and binds its listen address.
    pub async fn bind(config: &DaemonConfig) -> Result<Self, DaemonError> {
        let address = config.listen_address()?;
        let state = ListenerState::from_config(config)?;
        let listener = TcpListener::bind(address)
            .await
            .map_err(|source| DaemonError::Bind { address, source })?;
        let (shutdown, _) = broadcast::channel(1);
        info!(
            target: LOG_TARGET,
            address = %listener.local_addr().unwrap_or(address),
            codec = %config.codec,
            routes = state.routes.len(),
            clusters = state.clusters.len(),
            "listening"
        );
        Ok(Self {
            listener,
            state: Arc::new(state),
            registry: Arc::new(ConnectionRegistry::new()),
            permits: Arc::new(Semaphore::new(config.max_connections.max(1))),
            shutdown,
        })
    }

    /// Bound address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle for stopping the server from another task.
    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            sender: self.shutdown.clone(),
        }
    }

    /// Stats shared by every connection.
    #[must_use]
    pub fn stats(&self) -> Arc<ProxyStats> {
        Arc::clone(&self.state.stats)
    }

    /// Open downstream connections.
    #[must_use]
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Clusters and their host pools.
    #[must_use]
    pub fn clusters(&self) -> Arc<Clusters> {
        Arc::clone(&self.state.clusters)
    }

    /// Accepts connections until [`ShutdownHandle::shutdown`] is called.
    pub async fn serve(self) -> Result<(), DaemonError> {
        let mut shutdown = self.shutdown.subscribe();
        for limiter in self.state.limiters() {
            spawn_fill_ticks(Arc::clone(limiter), self.shutdown.subscribe());
        }

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(error) if is_transient(&error) => {
                            warn!(target: LOG_TARGET, %error, "accept failed");
                            continue;
                        }
                        Err(error) => return Err(DaemonError::Accept(error)),
                    };
                    let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                        warn!(target: LOG_TARGET, %peer, "connection limit reached, rejecting");
                        drop(stream);
                        continue;
                    };
                    let id = self.registry.register(peer);
                    let state = Arc::clone(&self.state);
                    let registry = Arc::clone(&self.registry);
                    let shutdown = self.shutdown.subscribe();
                    tokio::spawn(async move {
                        debug!(target: LOG_TARGET, %peer, connection = %id, "accepted");
                        serve_connection(stream, peer, &state, shutdown).await;
                        if let Some(info) = registry.unregister(id) {
                            debug!(
                                target: LOG_TARGET,
                                %peer,
                                connection = %id,
                                duration_ms = u64::try_from(info.duration().as_millis()).unwrap_or(u64::MAX),
                                "connection finished"
                            );
                        }
                        drop(permit);
                    });
                }
                _ = shutdown.recv() => {
                    info!(
                        target: LOG_TARGET,
                        open_connections = self.registry.count(),
                        "shutting down"
                    );
                    return Ok(());
                }
            }
        }
    }
}

fn is_transient(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

fn spawn_fill_ticks(limiter: Arc<LocalRateLimiter>, mut shutdown: broadcast::Receiver<()>) {
    let Some(period) = limiter.tick_interval() else {
        return;
    };
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval(period);
        ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                tick = ticks.tick() => limiter.on_fill_tick(tick.into_std()),
                _ = shutdown.recv() => break,
            }
        }
    });
}

async fn idle(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: &ListenerState,
    mut shutdown: broadcast::Receiver<()>,
) {
    if let Err(error) = stream.set_nodelay(true) {
        debug!(target: LOG_TARGET, %peer, %error, "failed to set TCP_NODELAY");
    }
    let (mut reader, writer) = stream.into_split();
    let (events, mut upstream_events) = mpsc::channel(UPSTREAM_EVENT_CAPACITY);
    let clusters: Arc<dyn ClusterManager> = Arc::new(ConnectionClusters::new(
        Arc::clone(&state.clusters),
        events,
    ));
    let config = Arc::new(state.connection_config(clusters));
    let (downstream, writer_task) = TcpDownstream::spawn(writer, peer);
    let mut manager = ConnectionManager::new(config, Box::new(downstream));
    let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);
    let mut reading = true;

    while !manager.is_closed() {
        let deadline = manager.idle_deadline();
        tokio::select! {
            read = reader.read_buf(&mut buffer), if reading => match read {
                Ok(0) => {
                    reading = false;
                    manager.on_data(BytesMut::new(), true);
                }
                Ok(_) => {
                    manager.on_data(buffer.split(), false);
                    buffer.reserve(READ_BUFFER_SIZE);
                }
                Err(error) => {
                    debug!(target: LOG_TARGET, %peer, %error, "downstream read failed");
                    manager.on_event(ConnectionEvent::RemoteClose);
                }
            },
            Some((target, event)) = upstream_events.recv() => {
                manager.on_upstream_event(target, event);
            }
            () = idle(deadline) => manager.on_idle_timeout(),
            _ = shutdown.recv() => manager.on_event(ConnectionEvent::LocalClose),
        }
    }

    drop(manager);
    finish_writer(peer, writer_task).await;
}

/// Waits for a downstream writer to drain. Returns `false` when it panicked or
/// was cancelled.
async fn finish_writer(peer: SocketAddr, writer_task: JoinHandle<()>) -> bool {
    match writer_task.await {
        Ok(()) => true,
        Err(error) => {
            warn!(target: LOG_TARGET, %peer, %error, "downstream writer task failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;
    use proxy::RouterConfig;

    fn config() -> DaemonConfig {
        DaemonConfig::from_json(
            r#"{
                "address": "127.0.0.1:0",
                "codec": "dubbo",
                "route_config": {"routes": [{"cluster": "a"}]},
                "filters": [
                    {"name": "local_ratelimit", "config": {"token_bucket": {"max_tokens": 5, "fill_interval_ms": 50}}},
                    {"name": "router", "config": {"multiplexing": true}}
                ],
                "clusters": [{"name": "a", "hosts": ["127.0.0.1:1"]}]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn limiters_are_shared_between_connections() {
        let state = ListenerState::from_config(&config()).unwrap();
        let (events, _rx) = mpsc::channel(1);
        let clusters: Arc<dyn ClusterManager> =
            Arc::new(ConnectionClusters::new(Arc::clone(&state.clusters), events));
        let first = state.connection_config(Arc::clone(&clusters));
        let second = state.connection_config(clusters);

        assert_eq!(first.filters().len(), 2);
        assert!(Arc::ptr_eq(
            &first.rate_limiters()[0],
            &second.rate_limiters()[0]
        ));
        assert!(Arc::ptr_eq(first.stats(), second.stats()));
        assert_eq!(first.routes().len(), 1);
        assert_eq!(state.limiters().count(), 1);
    }

    #[tokio::test]
    async fn bind_reports_local_address_and_stops() {
        let server = Server::bind(&config()).await.unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);
        let handle = server.shutdown_handle();
        let task = tokio::spawn(server.serve());
        tokio::task::yield_now().await;
        handle.shutdown();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn bind_failure_names_the_address() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = taken.local_addr().unwrap();
        let config = DaemonConfig::builder(CodecKind::Dubbo)
            .address(address)
            .filter(FilterConfig::Router(RouterConfig::default()))
            .cluster(ClusterConfig::new("a", &[]))
            .build()
            .unwrap();
        let error = Server::bind(&config).await.err().unwrap();
        assert!(matches!(error, DaemonError::Bind { .. }));
    }

    #[tokio::test]
    async fn writer_panic_is_reported() {
        let peer: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        assert!(finish_writer(peer, tokio::spawn(async {})).await);

        let failed: JoinHandle<()> = tokio::spawn(async { panic!("writer blew up") });
        assert!(!finish_writer(peer, failed).await);
    }
}
