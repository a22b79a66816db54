//! Serialized form of a route table.

use serde::{Deserialize, Serialize};

/// Ordered list of routes; the first route whose matchers all pass wins.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RouteConfig {
    /// Name used in logs.
    #[serde(default)]
    pub name: String,
    /// Routes in match order.
    #[serde(default)]
    pub routes: Vec<RouteSpec>,
}

/// One route entry.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RouteSpec {
    /// Header matchers that must all pass. Empty matches every request.
    #[serde(default, rename = "match")]
    pub matchers: Vec<HeaderMatcherSpec>,
    /// Destination cluster. Ignored when `weighted_clusters` is set.
    #[serde(default)]
    pub cluster: Option<String>,
    /// Clusters picked in proportion to their weight.
    #[serde(default)]
    pub weighted_clusters: Vec<WeightedClusterSpec>,
    /// Header names whose values feed the load-balancer hash.
    #[serde(default)]
    pub hash_policy: Vec<String>,
    /// Clusters that receive a copy of matched requests.
    #[serde(default)]
    pub request_mirror_policies: Vec<MirrorPolicySpec>,
    /// Key/value pairs written into the request on its way upstream.
    #[serde(default)]
    pub request_mutation: Vec<KeyValue>,
}

/// A header predicate.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct HeaderMatcherSpec {
    /// Header name.
    pub name: String,
    /// How the value is compared.
    #[serde(flatten)]
    pub kind: HeaderMatchKind,
    /// Negates the result for present headers.
    #[serde(default)]
    pub invert_match: bool,
}

/// Comparison applied by a [`HeaderMatcherSpec`].
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HeaderMatchKind {
    /// Value equals the string.
    ExactMatch(String),
    /// Value starts with the string.
    PrefixMatch(String),
    /// Value ends with the string.
    SuffixMatch(String),
    /// Value matches the whole regular expression.
    SafeRegexMatch(String),
    /// Header presence equals the flag.
    PresentMatch(bool),
}

/// Weighted cluster choice.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct WeightedClusterSpec {
    /// Cluster name.
    pub name: String,
    /// Relative weight.
    pub weight: u32,
}

/// Request mirroring target.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MirrorPolicySpec {
    /// Shadow cluster name.
    pub cluster: String,
    /// Share of matched requests to mirror, 0 to 100.
    #[serde(default = "full_percentage")]
    pub percentage: f64,
}

const fn full_percentage() -> f64 {
    100.0
}

/// A string pair.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct KeyValue {
    /// Key.
    pub key: String,
    /// Value.
    pub value: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_matcher_kind() {
        let config: RouteConfig = serde_json::from_str(
            r#"{
                "name": "local",
                "routes": [{
                    "match": [
                        {"name": "service", "exact_match": "Echo"},
                        {"name": "method", "prefix_match": "Get"},
                        {"name": "zone", "suffix_match": "-a"},
                        {"name": "uid", "safe_regex_match": "[0-9]+"},
                        {"name": "debug", "present_match": true, "invert_match": true}
                    ],
                    "cluster": "echo",
                    "hash_policy": ["uid"],
                    "request_mirror_policies": [{"cluster": "shadow"}],
                    "request_mutation": [{"key": "x-env", "value": "prod"}]
                }]
            }"#,
        )
        .unwrap();

        let route = &config.routes[0];
        assert_eq!(route.matchers.len(), 5);
        assert_eq!(
            route.matchers[3].kind,
            HeaderMatchKind::SafeRegexMatch("[0-9]+".into())
        );
        assert!(route.matchers[4].invert_match);
        assert_eq!(route.cluster.as_deref(), Some("echo"));
        assert!((route.request_mirror_policies[0].percentage - 100.0).abs() < f64::EPSILON);
        assert_eq!(route.request_mutation[0].key, "x-env");
    }

    #[test]
    fn rejects_unknown_route_fields() {
        let result: Result<RouteConfig, _> =
            serde_json::from_str(r#"{"routes": [{"cluster": "a", "timeout": 3}]}"#);
        assert!(result.is_err());
    }
}
