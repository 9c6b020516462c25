//! Route matching logic.
//!
//! # Responsibilities
//! - Match the hint's host (exact match, case-insensitive, port ignored)
//! - Match the hint's path prefix (case-sensitive)
//! - Combine conditions with AND semantics
//!
//! # Design Decisions
//! - Empty condition = always matches (wildcard)
//! - A condition on a field the hint lacks never matches
//! - No regex to guarantee O(n) matching

use crate::processor::Hint;

/// Trait for matching routing hints against conditions.
pub trait Matcher: Send + Sync + std::fmt::Debug {
    /// Returns true if the hint matches this condition.
    fn matches(&self, hint: &Hint) -> bool;
}

/// `host[:port]` → lowercase host. Bracketed IPv6 literals keep their brackets.
fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let bare = if host.starts_with('[') {
        host.split_inclusive(']').next().unwrap_or(host)
    } else {
        host.rsplit_once(':').map_or(host, |(h, _)| h)
    };
    bare.to_ascii_lowercase()
}

/// Matches the hint host.
#[derive(Debug, Clone)]
pub struct HostMatcher {
    expected_host: String,
}

impl HostMatcher {
    /// The host is normalized to lowercase for case-insensitive matching.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            expected_host: normalize_host(&host.into()),
        }
    }
}

impl Matcher for HostMatcher {
    fn matches(&self, hint: &Hint) -> bool {
        hint.host
            .as_deref()
            .is_some_and(|h| normalize_host(h) == self.expected_host)
    }
}

/// Matches the hint path prefix.
#[derive(Debug, Clone)]
pub struct PathPrefixMatcher {
    prefix: String,
}

impl PathPrefixMatcher {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Matcher for PathPrefixMatcher {
    fn matches(&self, hint: &Hint) -> bool {
        hint.uri
            .as_deref()
            .is_some_and(|uri| uri.starts_with(&self.prefix))
    }
}

/// Combines multiple matchers with AND semantics.
#[derive(Debug)]
pub struct AndMatcher {
    matchers: Vec<Box<dyn Matcher>>,
}

impl AndMatcher {
    pub fn new(matchers: Vec<Box<dyn Matcher>>) -> Self {
        Self { matchers }
    }
}

impl Matcher for AndMatcher {
    fn matches(&self, hint: &Hint) -> bool {
        self.matchers.iter().all(|m| m.matches(hint))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hint(host: Option<&str>, uri: Option<&str>) -> Hint {
        Hint::of_host_uri(host.map(String::from), uri.map(String::from))
    }

    #[test]
    fn test_host_matcher() {
        let matcher = HostMatcher::new("example.com");
        assert!(matcher.matches(&hint(Some("example.com"), None)));
        assert!(matcher.matches(&hint(Some("EXAMPLE.COM:8443"), None)));
        assert!(!matcher.matches(&hint(Some("other.com"), None)));
        assert!(!matcher.matches(&Hint::none()));
    }

    #[test]
    fn ipv6_host_keeps_brackets() {
        let matcher = HostMatcher::new("[::1]");
        assert!(matcher.matches(&hint(Some("[::1]:443"), None)));
    }

    #[test]
    fn test_path_matcher() {
        let matcher = PathPrefixMatcher::new("/api");
        assert!(matcher.matches(&hint(None, Some("/api/v1"))));
        assert!(!matcher.matches(&hint(None, Some("/images"))));
        assert!(!matcher.matches(&hint(Some("example.com"), None)));
    }

    #[test]
    fn empty_and_matches_everything() {
        assert!(AndMatcher::new(Vec::new()).matches(&Hint::none()));
    }
}
