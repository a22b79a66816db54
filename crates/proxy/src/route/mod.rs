//! crates/proxy/src/route/mod.rs
//!
//! Route table: header matchers select a route, the route names the cluster
//! (directly or by weight), a hash policy and mirror targets.

use std::sync::Arc;

use codec::{Metadata, Mutation};
use tracing::debug;

use crate::error::ProxyError;

/// Serde model of a route table.
pub mod config;
mod hash;
mod matcher;

pub use config::RouteConfig;
pub use hash::HashPolicy;
pub use matcher::HeaderMatcher;

/// Mirror target of a route.
#[derive(Clone, Debug, PartialEq)]
pub struct MirrorPolicy {
    cluster: String,
    percentage: f64,
}

impl MirrorPolicy {
    /// Shadow cluster.
    #[must_use]
    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// Decides from a per-request random value whether to mirror.
    #[must_use]
    pub fn should_mirror(&self, random: u64) -> bool {
        let threshold = (self.percentage.clamp(0.0, 100.0) * 100.0) as u64;
        random % 10_000 < threshold
    }
}

#[derive(Debug)]
enum ClusterTarget {
    Single(String),
    Weighted {
        clusters: Vec<(String, u32)>,
        total_weight: u64,
    },
}

/// A configured route.
#[derive(Debug)]
pub struct RouteEntry {
    matchers: Vec<HeaderMatcher>,
    target: ClusterTarget,
    hash_policy: HashPolicy,
    mirror_policies: Vec<MirrorPolicy>,
    request_mutation: Vec<(String, String)>,
}

impl RouteEntry {
    fn build(index: usize, spec: &config::RouteSpec) -> Result<Self, ProxyError> {
        let matchers = spec
            .matchers
            .iter()
            .map(|matcher| HeaderMatcher::compile(index, matcher))
            .collect::<Result<Vec<_>, _>>()?;

        let target = if spec.weighted_clusters.is_empty() {
            match spec.cluster.as_deref() {
                Some(cluster) if !cluster.is_empty() => ClusterTarget::Single(cluster.to_owned()),
                _ => {
                    return Err(ProxyError::InvalidRoute {
                        route: index,
                        reason: "route needs a cluster or weighted clusters",
                    });
                }
            }
        } else {
            let total_weight: u64 = spec
                .weighted_clusters
                .iter()
                .map(|cluster| u64::from(cluster.weight))
                .sum();
            if total_weight == 0 {
                return Err(ProxyError::InvalidRoute {
                    route: index,
                    reason: "weighted clusters must have a positive total weight",
                });
            }
            ClusterTarget::Weighted {
                clusters: spec
                    .weighted_clusters
                    .iter()
                    .map(|cluster| (cluster.name.clone(), cluster.weight))
                    .collect(),
                total_weight,
            }
        };

        Ok(Self {
            matchers,
            target,
            hash_policy: HashPolicy::new(spec.hash_policy.clone()),
            mirror_policies: spec
                .request_mirror_policies
                .iter()
                .map(|mirror| MirrorPolicy {
                    cluster: mirror.cluster.clone(),
                    percentage: mirror.percentage,
                })
                .collect(),
            request_mutation: spec
                .request_mutation
                .iter()
                .map(|pair| (pair.key.clone(), pair.value.clone()))
                .collect(),
        })
    }

    fn headers_match(&self, metadata: &Metadata) -> bool {
        self.matchers
            .iter()
            .all(|matcher| matcher.matches(metadata.headers()))
    }

    fn pick_cluster(&self, random: u64) -> usize {
        match &self.target {
            ClusterTarget::Single(_) => 0,
            ClusterTarget::Weighted {
                clusters,
                total_weight,
            } => {
                let selected = random % total_weight;
                let mut end = 0;
                for (index, (_, weight)) in clusters.iter().enumerate() {
                    end += u64::from(*weight);
                    if selected < end {
                        return index;
                    }
                }
                clusters.len() - 1
            }
        }
    }
}

/// Route resolved for one message: the entry plus the chosen cluster.
#[derive(Clone, Debug)]
pub struct Route {
    entry: Arc<RouteEntry>,
    cluster: usize,
}

impl Route {
    /// Cluster requests are sent to.
    #[must_use]
    pub fn cluster_name(&self) -> &str {
        match &self.entry.target {
            ClusterTarget::Single(name) => name,
            ClusterTarget::Weighted { clusters, .. } => &clusters[self.cluster].0,
        }
    }

    /// Hash policy of the route.
    #[must_use]
    pub fn hash_policy(&self) -> &HashPolicy {
        &self.entry.hash_policy
    }

    /// Mirror targets of the route.
    #[must_use]
    pub fn mirror_policies(&self) -> &[MirrorPolicy] {
        &self.entry.mirror_policies
    }

    /// Writes the route's configured request edits into `mutation`.
    pub fn apply_request_mutation(&self, mutation: &mut Mutation) {
        for (key, value) in &self.entry.request_mutation {
            mutation.put_string(key.clone(), value.clone());
        }
    }
}

/// Ordered set of routes. Clones share the compiled entries.
#[derive(Clone, Debug, Default)]
pub struct RouteTable {
    name: String,
    entries: Vec<Arc<RouteEntry>>,
}

impl RouteTable {
    /// Compiles `config`.
    pub fn from_config(config: &RouteConfig) -> Result<Self, ProxyError> {
        let entries = config
            .routes
            .iter()
            .enumerate()
            .map(|(index, spec)| RouteEntry::build(index, spec).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;
        debug!(
            target: "meta_proxy::router",
            name = %config.name,
            routes = entries.len(),
            "route table compiled"
        );
        Ok(Self {
            name: config.name.clone(),
            entries,
        })
    }

    /// Table name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of routes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when the table has no routes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First route whose matchers accept `metadata`. `random` picks among
    /// weighted clusters.
    #[must_use]
    pub fn route(&self, metadata: &Metadata, random: u64) -> Option<Route> {
        self.entries
            .iter()
            .find(|entry| entry.headers_match(metadata))
            .map(|entry| Route {
                cluster: entry.pick_cluster(random),
                entry: Arc::clone(entry),
            })
    }
}
