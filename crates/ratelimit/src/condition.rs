use std::collections::HashMap;
use std::hash::BuildHasher;

use crate::bucket::TokenBucket;

/// Read-only view of the route headers a request carries.
pub trait HeaderSource {
    /// Returns the value of `key`, if present.
    fn header(&self, key: &str) -> Option<&str>;
}

impl<S: BuildHasher> HeaderSource for HashMap<String, String, S> {
    fn header(&self, key: &str) -> Option<&str> {
        self.get(key).map(String::as_str)
    }
}

impl HeaderSource for [(&str, &str)] {
    fn header(&self, key: &str) -> Option<&str> {
        self.iter()
            .find(|(name, _)| *name == key)
            .map(|(_, value)| *value)
    }
}

impl<T: HeaderSource + ?Sized> HeaderSource for &T {
    fn header(&self, key: &str) -> Option<&str> {
        (**self).header(key)
    }
}

/// One header test. The header must be present and non-empty; when `value`
/// is set and non-empty the header must also equal it.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(deny_unknown_fields))]
pub struct HeaderMatch {
    /// Header name.
    pub key: String,
    /// Expected value, or `None` for a presence test.
    #[cfg_attr(feature = "serde", serde(default))]
    pub value: Option<String>,
}

impl HeaderMatch {
    /// Matches any non-empty value of `key`.
    pub fn present(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: None,
        }
    }

    /// Matches `key` only when it equals `value`.
    pub fn exact(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
        }
    }

    /// Tests the matcher against `headers`.
    pub fn matches<H: HeaderSource + ?Sized>(&self, headers: &H) -> bool {
        headers
            .header(&self.key)
            .filter(|actual| !actual.is_empty())
            .is_some_and(|actual| {
                self.value
                    .as_deref()
                    .is_none_or(|expected| expected.is_empty() || expected == actual)
            })
    }
}

/// A bucket that applies to requests whose headers satisfy every matcher.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(deny_unknown_fields))]
pub struct RateLimitCondition {
    /// Matchers that must all hit. An empty list matches every request.
    #[cfg_attr(feature = "serde", serde(default, rename = "match"))]
    pub matches: Vec<HeaderMatch>,
    /// Bucket consumed by matching requests.
    pub token_bucket: TokenBucket,
}

impl RateLimitCondition {
    /// Creates a condition from its matchers and bucket.
    pub const fn new(matches: Vec<HeaderMatch>, token_bucket: TokenBucket) -> Self {
        Self {
            matches,
            token_bucket,
        }
    }

    /// Returns `true` when every matcher hits.
    pub fn matches<H: HeaderSource + ?Sized>(&self, headers: &H) -> bool {
        self.matches.iter().all(|matcher| matcher.matches(headers))
    }
}
