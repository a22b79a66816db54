//! Static clusters and host selection.
//!
//! [`Clusters`] is built once per listener from the configuration and owns
//! one [`HostPool`] per upstream host. Each downstream connection wraps it in
//! a [`ConnectionClusters`] carrying that connection's event channel, so pool
//! completions land in the task that asked for them.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use proxy::{
    ClusterInfo, ClusterManager, ConnectionPool, LoadBalancerContext, UpstreamEvent,
    UpstreamTarget,
};
use tokio::sync::mpsc;

use crate::config::{ClusterConfig, ConfigError, LbPolicy};
use crate::upstream::{HostPool, HostStatsSnapshot, TcpPool};

/// Channel feeding upstream completions back to one connection task.
///
/// Senders await capacity, so a connection task that falls behind stops its
/// upstream sockets from being read.
pub type EventSink = mpsc::Sender<(UpstreamTarget, UpstreamEvent)>;

/// Upstream events buffered per downstream connection.
pub const UPSTREAM_EVENT_CAPACITY: usize = 256;

#[derive(Debug)]
struct Cluster {
    info: ClusterInfo,
    lb_policy: LbPolicy,
    hosts: Vec<Arc<HostPool>>,
    next: AtomicUsize,
}

impl Cluster {
    fn from_config(config: &ClusterConfig) -> Result<Self, ConfigError> {
        let hosts = config
            .host_addresses()?
            .into_iter()
            .map(|address| {
                Arc::new(HostPool::new(
                    address,
                    config.connect_timeout(),
                    config.max_connections(),
                ))
            })
            .collect();
        Ok(Self {
            info: ClusterInfo {
                name: config.name.clone(),
                maintenance_mode: config.maintenance_mode,
            },
            lb_policy: config.lb_policy,
            hosts,
            next: AtomicUsize::new(0),
        })
    }

    fn choose(&self, context: &LoadBalancerContext) -> Option<&Arc<HostPool>> {
        if self.hosts.is_empty() {
            return None;
        }
        let len = self.hosts.len();
        let index = match (self.lb_policy, context.hash_key) {
            (LbPolicy::Hash, Some(hash)) => {
                usize::try_from(hash % len as u64).unwrap_or_default()
            }
            _ => self.next.fetch_add(1, Ordering::Relaxed) % len,
        };
        self.hosts.get(index)
    }
}

/// Every configured cluster, shared by all connections of a listener.
#[derive(Debug, Default)]
pub struct Clusters {
    clusters: HashMap<String, Cluster>,
}

impl Clusters {
    /// Builds the clusters and their host pools.
    pub fn from_configs(configs: &[ClusterConfig]) -> Result<Self, ConfigError> {
        let mut clusters = HashMap::with_capacity(configs.len());
        for config in configs {
            let cluster = Cluster::from_config(config)?;
            if clusters.insert(config.name.clone(), cluster).is_some() {
                return Err(ConfigError::DuplicateCluster(config.name.clone()));
            }
        }
        Ok(Self { clusters })
    }

    /// Number of clusters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    /// Returns `true` without clusters.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    /// Host pools of `cluster`, in configuration order.
    pub fn hosts(&self, cluster: &str) -> Option<&[Arc<HostPool>]> {
        self.clusters
            .get(cluster)
            .map(|cluster| cluster.hosts.as_slice())
    }

    /// Per-host connection and outlier counters, sorted by cluster name.
    #[must_use]
    pub fn host_stats(&self) -> Vec<(String, SocketAddr, HostStatsSnapshot)> {
        let mut stats: Vec<_> = self
            .clusters
            .iter()
            .flat_map(|(name, cluster)| {
                cluster
                    .hosts
                    .iter()
                    .map(move |host| (name.clone(), host.address(), host.stats()))
            })
            .collect();
        stats.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
        stats
    }
}

/// The clusters as seen by one downstream connection.
#[derive(Debug)]
pub struct ConnectionClusters {
    clusters: Arc<Clusters>,
    events: EventSink,
}

impl ConnectionClusters {
    /// Binds `clusters` to a connection's event channel.
    pub const fn new(clusters: Arc<Clusters>, events: EventSink) -> Self {
        Self { clusters, events }
    }
}

impl ClusterManager for ConnectionClusters {
    fn get(&self, cluster: &str) -> Option<ClusterInfo> {
        self.clusters
            .clusters
            .get(cluster)
            .map(|cluster| cluster.info.clone())
    }

    fn tcp_conn_pool(
        &self,
        cluster: &str,
        context: &LoadBalancerContext,
    ) -> Option<Arc<dyn ConnectionPool>> {
        let host = self.clusters.clusters.get(cluster)?.choose(context)?;
        Some(Arc::new(TcpPool::new(Arc::clone(host), self.events.clone())))
    }
}
