#![deny(unsafe_code)]

//! Daemon configuration file.
//!
//! The file is a JSON document describing one listener: where it binds, the
//! protocol it speaks, its route table, its filter chain and the static
//! clusters requests are routed to. [`DaemonConfig::load`] reads and validates
//! it; [`DaemonConfig::builder`] assembles the same structure in code.

use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use codec::CodecKind;
use logging::LogConfig;
use proxy::route::RouteConfig;
use proxy::{DEFAULT_STAT_PREFIX, FilterConfig};
use serde::Deserialize;
use thiserror::Error;

/// Address the listener binds when none is configured.
pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0:20880";
/// Connect timeout for upstream hosts when a cluster sets none.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Open plus connecting upstream connections allowed per host.
pub const DEFAULT_MAX_UPSTREAM_CONNECTIONS: usize = 1024;
/// Concurrent downstream connections accepted by the listener.
pub const DEFAULT_MAX_DOWNSTREAM_CONNECTIONS: usize = 10_000;

/// Error produced while loading or validating a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// File that was being read.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The document is not valid configuration JSON.
    #[error("invalid configuration{}: {source}", describe_path(.path.as_deref()))]
    Parse {
        /// File being parsed, when loaded from disk.
        path: Option<PathBuf>,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
    /// Two clusters share a name.
    #[error("cluster '{0}' is defined more than once")]
    DuplicateCluster(String),
    /// A cluster host is not a socket address.
    #[error("cluster '{cluster}': invalid host '{host}'")]
    InvalidHost {
        /// Cluster naming the host.
        cluster: String,
        /// Rejected value.
        host: String,
    },
    /// The filter chain does not end with the router.
    #[error("the filter chain must end with the router filter")]
    MissingRouter,
    /// The listener address is not a socket address.
    #[error("invalid listen address '{0}'")]
    InvalidAddress(String),
}

fn describe_path(path: Option<&Path>) -> String {
    path.map_or_else(String::new, |path| format!(" in {}", path.display()))
}

/// Host selection within a cluster.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum LbPolicy {
    /// Hosts take turns; the route's hash key is ignored.
    #[default]
    RoundRobin,
    /// The route's hash key picks the host; requests without one take turns.
    Hash,
}

/// One static cluster.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    /// Cluster name referenced by routes.
    pub name: String,
    /// Upstream hosts as `ip:port`.
    #[serde(default)]
    pub hosts: Vec<String>,
    /// Host selection policy.
    #[serde(default)]
    pub lb_policy: LbPolicy,
    /// Requests to a cluster in maintenance mode are rejected.
    #[serde(default)]
    pub maintenance_mode: bool,
    /// Upstream connect timeout in milliseconds.
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
    /// Limit on open plus connecting connections per host.
    #[serde(default)]
    pub max_connections: Option<usize>,
}

impl ClusterConfig {
    /// A round-robin cluster over `hosts`.
    pub fn new(name: impl Into<String>, hosts: &[SocketAddr]) -> Self {
        Self {
            name: name.into(),
            hosts: hosts.iter().map(ToString::to_string).collect(),
            lb_policy: LbPolicy::default(),
            maintenance_mode: false,
            connect_timeout_ms: None,
            max_connections: None,
        }
    }

    /// Connect timeout, defaulted.
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout_ms
            .map_or(DEFAULT_CONNECT_TIMEOUT, Duration::from_millis)
    }

    /// Connection limit per host, defaulted.
    pub fn max_connections(&self) -> usize {
        self.max_connections
            .unwrap_or(DEFAULT_MAX_UPSTREAM_CONNECTIONS)
            .max(1)
    }

    /// Parsed host addresses.
    pub fn host_addresses(&self) -> Result<Vec<SocketAddr>, ConfigError> {
        self.hosts
            .iter()
            .map(|host| {
                host.parse().map_err(|_| ConfigError::InvalidHost {
                    cluster: self.name.clone(),
                    host: host.clone(),
                })
            })
            .collect()
    }
}

fn default_address() -> String {
    DEFAULT_LISTEN_ADDRESS.to_owned()
}

fn default_stat_prefix() -> String {
    DEFAULT_STAT_PREFIX.to_owned()
}

const fn default_max_connections() -> usize {
    DEFAULT_MAX_DOWNSTREAM_CONNECTIONS
}

/// Complete daemon configuration.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    /// Listen address.
    #[serde(default = "default_address")]
    pub address: String,
    /// Protocol spoken on the listener.
    pub codec: CodecKind,
    /// Stats prefix.
    #[serde(default = "default_stat_prefix")]
    pub stat_prefix: String,
    /// Downstream idle timeout in milliseconds; absent disables it.
    #[serde(default)]
    pub idle_timeout_ms: Option<u64>,
    /// Concurrent downstream connections accepted.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Route table.
    #[serde(default)]
    pub route_config: RouteConfig,
    /// Filter chain, ending with the router.
    #[serde(default)]
    pub filters: Vec<FilterConfig>,
    /// Static clusters.
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
    /// Logging, overridden by command-line flags.
    #[serde(default)]
    pub log: Option<LogConfig>,
}

impl DaemonConfig {
    /// Starts a configuration for `codec` with defaults everywhere else.
    pub fn builder(codec: CodecKind) -> DaemonConfigBuilder {
        DaemonConfigBuilder::new(codec)
    }

    /// Reads and validates the file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: Some(path.to_path_buf()),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Parses and validates a JSON document.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(text).map_err(|source| ConfigError::Parse { path: None, source })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks what serde cannot: addresses, unique cluster names and the
    /// router at the end of the chain.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_address()?;
        let mut names = HashSet::new();
        for cluster in &self.clusters {
            if !names.insert(cluster.name.as_str()) {
                return Err(ConfigError::DuplicateCluster(cluster.name.clone()));
            }
            cluster.host_addresses()?;
        }
        match self.filters.last() {
            Some(FilterConfig::Router(_)) => Ok(()),
            _ => Err(ConfigError::MissingRouter),
        }
    }

    /// Parsed listen address.
    pub fn listen_address(&self) -> Result<SocketAddr, ConfigError> {
        self.address
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(self.address.clone()))
    }

    /// Idle timeout as a duration.
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }
}

/// Builder for [`DaemonConfig`].
#[derive(Clone, Debug)]
pub struct DaemonConfigBuilder {
    config: DaemonConfig,
}

impl DaemonConfigBuilder {
    fn new(codec: CodecKind) -> Self {
        Self {
            config: DaemonConfig {
                address: default_address(),
                codec,
                stat_prefix: default_stat_prefix(),
                idle_timeout_ms: None,
                max_connections: DEFAULT_MAX_DOWNSTREAM_CONNECTIONS,
                route_config: RouteConfig::default(),
                filters: Vec::new(),
                clusters: Vec::new(),
                log: None,
            },
        }
    }

    /// Sets the listen address.
    pub fn address(mut self, address: SocketAddr) -> Self {
        self.config.address = address.to_string();
        self
    }

    /// Sets the idle timeout.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Uses `routes` as the route table.
    pub fn routes(mut self, routes: RouteConfig) -> Self {
        self.config.route_config = routes;
        self
    }

    /// Appends a filter.
    pub fn filter(mut self, filter: FilterConfig) -> Self {
        self.config.filters.push(filter);
        self
    }

    /// Adds a cluster.
    pub fn cluster(mut self, cluster: ClusterConfig) -> Self {
        self.config.clusters.push(cluster);
        self
    }

    /// Validates and returns the configuration.
    pub fn build(self) -> Result<DaemonConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
