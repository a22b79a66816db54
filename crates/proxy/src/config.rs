//! crates/proxy/src/config.rs
//!
//! Listener-wide engine configuration shared by every connection manager.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use codec::{Codec, CodecKind};
use ratelimit::{LocalRateLimitConfig, LocalRateLimiter};
use serde::Deserialize;

use crate::error::ProxyError;
use crate::filter::FilterFactory;
use crate::rate_limit::LocalRateLimitFactory;
use crate::route::{RouteConfig, RouteTable};
use crate::router::RouterFactory;
use crate::stats::ProxyStats;
use crate::upstream::ClusterManager;

/// Prefix for stats when none is configured.
pub const DEFAULT_STAT_PREFIX: &str = "meta_protocol";

/// Idle timeout when none is configured.
pub const DEFAULT_IDLE_TIMEOUT: Option<Duration> = None;

/// One entry of the filter list, as written in a configuration file.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "name", content = "config", rename_all = "snake_case")]
pub enum FilterConfig {
    /// Local token bucket rate limiting.
    LocalRatelimit(LocalRateLimitConfig),
    /// The terminal router.
    Router(RouterConfig),
}

/// Router filter options.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RouterConfig {
    /// Share one upstream connection per host between two-way requests.
    #[serde(default)]
    pub multiplexing: bool,
}

/// Immutable engine configuration.
pub struct ProxyConfig {
    stat_prefix: String,
    codec: CodecKind,
    routes: RouteTable,
    filters: Vec<Arc<dyn FilterFactory>>,
    rate_limiters: Vec<Arc<LocalRateLimiter>>,
    idle_timeout: Option<Duration>,
    stats: Arc<ProxyStats>,
}

impl ProxyConfig {
    /// Starts a configuration for connections speaking `codec`.
    pub fn builder(codec: CodecKind) -> ProxyConfigBuilder {
        ProxyConfigBuilder::new(codec)
    }

    /// Prefix under which stats are reported.
    pub fn stat_prefix(&self) -> &str {
        &self.stat_prefix
    }

    /// Protocol of the listener.
    pub const fn codec_kind(&self) -> CodecKind {
        self.codec
    }

    /// Creates a codec for the listener's protocol.
    pub fn create_codec(&self) -> Box<dyn Codec> {
        self.codec.new_codec()
    }

    /// Route table.
    pub const fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Filter factories, in chain order.
    pub fn filters(&self) -> &[Arc<dyn FilterFactory>] {
        &self.filters
    }

    /// Limiters whose fill tick the runtime must drive.
    pub fn rate_limiters(&self) -> &[Arc<LocalRateLimiter>] {
        &self.rate_limiters
    }

    /// Downstream idle timeout; `None` disables the timer.
    pub const fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    /// Stats shared by every connection of the listener.
    pub const fn stats(&self) -> &Arc<ProxyStats> {
        &self.stats
    }
}

impl fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("stat_prefix", &self.stat_prefix)
            .field("codec", &self.codec)
            .field("routes", &self.routes.len())
            .field(
                "filters",
                &self.filters.iter().map(|f| f.name()).collect::<Vec<_>>(),
            )
            .field("idle_timeout", &self.idle_timeout)
            .finish_non_exhaustive()
    }
}

/// Builder for [`ProxyConfig`].
pub struct ProxyConfigBuilder {
    stat_prefix: String,
    codec: CodecKind,
    routes: RouteTable,
    filters: Vec<Arc<dyn FilterFactory>>,
    rate_limiters: Vec<Arc<LocalRateLimiter>>,
    idle_timeout: Option<Duration>,
    stats: Option<Arc<ProxyStats>>,
}

impl ProxyConfigBuilder {
    fn new(codec: CodecKind) -> Self {
        Self {
            stat_prefix: DEFAULT_STAT_PREFIX.to_owned(),
            codec,
            routes: RouteTable::default(),
            filters: Vec::new(),
            rate_limiters: Vec::new(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            stats: None,
        }
    }

    /// Sets the stats prefix.
    pub fn stat_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.stat_prefix = prefix.into();
        self
    }

    /// Uses a compiled route table.
    pub fn route_table(mut self, routes: RouteTable) -> Self {
        self.routes = routes;
        self
    }

    /// Compiles and uses `config`.
    pub fn routes(mut self, config: &RouteConfig) -> Result<Self, ProxyError> {
        self.routes = RouteTable::from_config(config)?;
        Ok(self)
    }

    /// Appends a filter factory.
    pub fn filter(mut self, factory: Arc<dyn FilterFactory>) -> Self {
        self.filters.push(factory);
        self
    }

    /// Appends a rate limit filter and records its limiter.
    pub fn rate_limit(mut self, factory: LocalRateLimitFactory) -> Self {
        self.rate_limiters.push(Arc::clone(factory.limiter()));
        self.filters.push(Arc::new(factory));
        self
    }

    /// Appends the filters described by `configs`, in order.
    pub fn filter_configs(
        mut self,
        configs: &[FilterConfig],
        cluster_manager: &Arc<dyn ClusterManager>,
    ) -> Result<Self, ProxyError> {
        for config in configs {
            self = match config {
                FilterConfig::LocalRatelimit(config) => {
                    self.rate_limit(LocalRateLimitFactory::new(config.clone())?)
                }
                FilterConfig::Router(config) => self.filter(Arc::new(RouterFactory::new(
                    Arc::clone(cluster_manager),
                    config.multiplexing,
                ))),
            };
        }
        Ok(self)
    }

    /// Sets the downstream idle timeout.
    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Shares `stats` instead of creating fresh ones.
    pub fn stats(mut self, stats: Arc<ProxyStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Finishes the configuration.
    pub fn build(self) -> ProxyConfig {
        ProxyConfig {
            stat_prefix: self.stat_prefix,
            codec: self.codec,
            routes: self.routes,
            filters: self.filters,
            rate_limiters: self.rate_limiters,
            idle_timeout: self.idle_timeout,
            stats: self.stats.unwrap_or_default(),
        }
    }
}
