use regex::Regex;
use rustc_hash::FxHashMap;

use crate::error::ProxyError;
use crate::route::config::{HeaderMatchKind, HeaderMatcherSpec};

#[derive(Debug)]
enum Matcher {
    Exact(String),
    Prefix(String),
    Suffix(String),
    Regex(Regex),
    Present(bool),
}

/// Compiled header predicate.
#[derive(Debug)]
pub struct HeaderMatcher {
    name: String,
    matcher: Matcher,
    invert: bool,
}

impl HeaderMatcher {
    pub(crate) fn compile(route: usize, spec: &HeaderMatcherSpec) -> Result<Self, ProxyError> {
        let matcher = match &spec.kind {
            HeaderMatchKind::ExactMatch(value) => Matcher::Exact(value.clone()),
            HeaderMatchKind::PrefixMatch(value) => Matcher::Prefix(value.clone()),
            HeaderMatchKind::SuffixMatch(value) => Matcher::Suffix(value.clone()),
            HeaderMatchKind::SafeRegexMatch(pattern) => {
                let anchored = format!("^(?:{pattern})$");
                Matcher::Regex(Regex::new(&anchored).map_err(|source| {
                    ProxyError::InvalidRegex {
                        route,
                        header: spec.name.clone(),
                        source,
                    }
                })?)
            }
            HeaderMatchKind::PresentMatch(expected) => Matcher::Present(*expected),
        };
        Ok(Self {
            name: spec.name.clone(),
            matcher,
            invert: spec.invert_match,
        })
    }

    /// Header the matcher inspects.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Evaluates the predicate.
    ///
    /// A missing header fails every value comparison whatever `invert_match`
    /// says; only a presence matcher can accept it.
    #[must_use]
    pub fn matches(&self, headers: &FxHashMap<String, String>) -> bool {
        let value = headers.get(&self.name);
        let matched = match (&self.matcher, value) {
            (Matcher::Present(expected), value) => value.is_some() == *expected,
            (_, None) => return false,
            (Matcher::Exact(expected), Some(value)) => value == expected,
            (Matcher::Prefix(prefix), Some(value)) => value.starts_with(prefix.as_str()),
            (Matcher::Suffix(suffix), Some(value)) => value.ends_with(suffix.as_str()),
            (Matcher::Regex(regex), Some(value)) => regex.is_match(value),
        };
        matched != self.invert
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher(kind: HeaderMatchKind, invert_match: bool) -> HeaderMatcher {
        HeaderMatcher::compile(
            0,
            &HeaderMatcherSpec {
                name: "method".into(),
                kind,
                invert_match,
            },
        )
        .unwrap()
    }

    fn headers(value: Option<&str>) -> FxHashMap<String, String> {
        value
            .map(|value| [("method".to_owned(), value.to_owned())].into_iter().collect())
            .unwrap_or_default()
    }

    #[test]
    fn value_comparisons() {
        let value = headers(Some("GetUser"));
        assert!(matcher(HeaderMatchKind::ExactMatch("GetUser".into()), false).matches(&value));
        assert!(matcher(HeaderMatchKind::PrefixMatch("Get".into()), false).matches(&value));
        assert!(matcher(HeaderMatchKind::SuffixMatch("User".into()), false).matches(&value));
        assert!(!matcher(HeaderMatchKind::SuffixMatch("Get".into()), false).matches(&value));
        assert!(matcher(HeaderMatchKind::ExactMatch("Put".into()), true).matches(&value));
    }

    #[test]
    fn regex_must_match_whole_value() {
        let digits = matcher(HeaderMatchKind::SafeRegexMatch("[A-Za-z]+".into()), false);
        assert!(digits.matches(&headers(Some("GetUser"))));
        assert!(!digits.matches(&headers(Some("Get User"))));
    }

    #[test]
    fn missing_header_only_satisfies_presence_checks() {
        let missing = headers(None);
        assert!(!matcher(HeaderMatchKind::ExactMatch("x".into()), true).matches(&missing));
        assert!(matcher(HeaderMatchKind::PresentMatch(false), false).matches(&missing));
        assert!(matcher(HeaderMatchKind::PresentMatch(true), true).matches(&missing));
        assert!(!matcher(HeaderMatchKind::PresentMatch(true), false).matches(&missing));
    }

    #[test]
    fn bad_regex_reports_route_and_header() {
        let error = HeaderMatcher::compile(
            4,
            &HeaderMatcherSpec {
                name: "uid".into(),
                kind: HeaderMatchKind::SafeRegexMatch("(".into()),
                invert_match: false,
            },
        )
        .unwrap_err();
        assert!(error.to_string().starts_with("route 4: invalid regex for header 'uid'"));
    }
}
