//! Per-source proxy selection.
//!
//! Proxies come from two places: explicit overrides given on the command line,
//! and an optional proxies file mapping source patterns to proxies. For each
//! scheme the precedence is:
//!
//! 1. `--http-proxy` / `--https-proxy`
//! 2. `--proxy` (both schemes)
//! 3. The **first** rule, in file order, whose pattern matches the source
//! 4. Direct connection
//!
//! Rule order is significant: a broad pattern such as `.*` listed first
//! shadows every rule after it.

use crate::feed::Source;
use regex::Regex;
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use std::fmt;

/// Proxy to use per URL scheme. Both `None` means a direct connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ProxyMap {
    pub http: Option<String>,
    pub https: Option<String>,
}

impl ProxyMap {
    pub fn is_direct(&self) -> bool {
        self.http.is_none() && self.https.is_none()
    }
}

impl fmt::Display for ProxyMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "http={}, https={}",
            self.http.as_deref().unwrap_or("direct"),
            self.https.as_deref().unwrap_or("direct")
        )
    }
}

/// Proxy settings given on the command line.
#[derive(Debug, Clone, Default)]
pub struct ProxyOverrides {
    /// Applied to both schemes unless a per-scheme override is set.
    pub proxy: Option<String>,
    pub http: Option<String>,
    pub https: Option<String>,
}

/// Value side of a proxies-file entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ProxyValue {
    /// One proxy for every scheme.
    All(String),
    /// Only the schemes present are set.
    PerScheme {
        #[serde(default)]
        http: Option<String>,
        #[serde(default)]
        https: Option<String>,
    },
}

/// A compiled `pattern → proxy` entry.
#[derive(Debug, Clone)]
pub struct ProxyRule {
    pub pattern: Regex,
    pub value: ProxyValue,
}

/// Ordered rule list, deserialized from a JSON object whose key order is kept.
///
/// Patterns are kept as strings here; [`ProxyRules::compile`] turns them into
/// [`ProxyRule`]s so an invalid pattern can be reported with its text.
#[derive(Debug, Clone, Default)]
pub struct ProxyRules(pub Vec<(String, ProxyValue)>);

impl ProxyRules {
    pub fn compile(self) -> Result<Vec<ProxyRule>, (String, regex::Error)> {
        self.0
            .into_iter()
            .map(|(pattern, value)| match Regex::new(&pattern) {
                Ok(pattern) => Ok(ProxyRule { pattern, value }),
                Err(e) => Err((pattern, e)),
            })
            .collect()
    }
}

impl<'de> Deserialize<'de> for ProxyRules {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OrderedRules;

        impl<'de> Visitor<'de> for OrderedRules {
            type Value = ProxyRules;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an object mapping source patterns to proxies")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut rules = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((pattern, value)) = map.next_entry::<String, ProxyValue>()? {
                    rules.push((pattern, value));
                }
                Ok(ProxyRules(rules))
            }
        }

        deserializer.deserialize_map(OrderedRules)
    }
}

/// Proxies chosen for one source, and where they came from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedProxy {
    pub map: ProxyMap,
    /// At least one scheme was set from the command line.
    pub from_overrides: bool,
    /// Pattern of the rule that supplied at least one scheme.
    pub rule: Option<String>,
}

impl ResolvedProxy {
    /// Human-readable origin for logs, `None` for direct connections.
    pub fn origin(&self) -> Option<String> {
        match (&self.rule, self.from_overrides) {
            (Some(rule), true) => Some(format!("command line and matched pattern \"{rule}\"")),
            (Some(rule), false) => Some(format!("matched pattern \"{rule}\"")),
            (None, true) => Some("command line".to_string()),
            (None, false) => None,
        }
    }
}

/// Resolves the proxy for each source. Pure: no I/O, no shared state.
#[derive(Debug, Clone, Default)]
pub struct ProxyResolver {
    overrides: ProxyOverrides,
    rules: Vec<ProxyRule>,
}

impl ProxyResolver {
    pub fn new(overrides: ProxyOverrides, rules: Vec<ProxyRule>) -> Self {
        Self { overrides, rules }
    }

    pub fn resolve(&self, source: &Source) -> ResolvedProxy {
        self.resolve_str(source.as_str())
    }

    pub fn resolve_str(&self, source: &str) -> ResolvedProxy {
        let http_override = self.overrides.http.as_ref().or(self.overrides.proxy.as_ref());
        let https_override = self
            .overrides
            .https
            .as_ref()
            .or(self.overrides.proxy.as_ref());

        // First match wins, even when a later rule is more specific.
        let rule = self.rules.iter().find(|r| r.pattern.is_match(source));
        let (rule_http, rule_https) = match rule.map(|r| &r.value) {
            Some(ProxyValue::All(proxy)) => (Some(proxy), Some(proxy)),
            Some(ProxyValue::PerScheme { http, https }) => (http.as_ref(), https.as_ref()),
            None => (None, None),
        };

        let map = ProxyMap {
            http: http_override.or(rule_http).cloned(),
            https: https_override.or(rule_https).cloned(),
        };

        let rule_used = (http_override.is_none() && rule_http.is_some())
            || (https_override.is_none() && rule_https.is_some());

        ResolvedProxy {
            map,
            from_overrides: http_override.is_some() || https_override.is_some(),
            rule: rule
                .filter(|_| rule_used)
                .map(|r| r.pattern.as_str().to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(json: &str) -> Vec<ProxyRule> {
        serde_json::from_str::<ProxyRules>(json)
            .unwrap()
            .compile()
            .unwrap()
    }

    #[test]
    fn test_no_rules_no_overrides_is_direct() {
        let resolver = ProxyResolver::default();
        let resolved = resolver.resolve_str("https://example.org/feed");
        assert!(resolved.map.is_direct());
        assert_eq!(resolved.origin(), None);
    }

    #[test]
    fn test_key_order_preserved() {
        let parsed: ProxyRules =
            serde_json::from_str(r#"{"z": "p1", "a": "p2", "m": {"http": "p3"}}"#).unwrap();
        let keys: Vec<&str> = parsed.0.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["z", "a", "m"]);
    }

    #[test]
    fn test_first_match_wins_over_more_specific() {
        let resolver = ProxyResolver::new(
            ProxyOverrides::default(),
            rules(
                r#"{".*": "http://broad:3128", "^https?://localhost/": "http://local:8080"}"#,
            ),
        );
        let resolved = resolver.resolve_str("http://localhost/feed.xml");
        assert_eq!(resolved.map.http.as_deref(), Some("http://broad:3128"));
        assert_eq!(resolved.map.https.as_deref(), Some("http://broad:3128"));
        assert_eq!(resolved.rule.as_deref(), Some(".*"));
    }

    #[test]
    fn test_specific_rule_applies_when_listed_first() {
        let resolver = ProxyResolver::new(
            ProxyOverrides::default(),
            rules(
                r#"{"^https?://localhost/": "http://local:8080", ".*": "http://broad:3128"}"#,
            ),
        );
        assert_eq!(
            resolver.resolve_str("http://localhost/feed.xml").map.http.as_deref(),
            Some("http://local:8080")
        );
        assert_eq!(
            resolver.resolve_str("https://example.org/").map.http.as_deref(),
            Some("http://broad:3128")
        );
    }

    #[test]
    fn test_pattern_searches_anywhere() {
        let resolver = ProxyResolver::new(
            ProxyOverrides::default(),
            rules(r#"{"example\\.org": "http://p:1"}"#),
        );
        assert!(!resolver
            .resolve_str("https://news.example.org/rss")
            .map
            .is_direct());
    }

    #[test]
    fn test_per_scheme_rule_sets_only_named_schemes() {
        let resolver = ProxyResolver::new(
            ProxyOverrides::default(),
            rules(r#"{".*": {"https": "http://secure:443"}}"#),
        );
        let resolved = resolver.resolve_str("https://example.org/");
        assert_eq!(resolved.map.http, None);
        assert_eq!(resolved.map.https.as_deref(), Some("http://secure:443"));
    }

    #[test]
    fn test_scheme_overrides_beat_global_and_rules() {
        let resolver = ProxyResolver::new(
            ProxyOverrides {
                proxy: Some("http://global:1".into()),
                http: Some("http://plain:2".into()),
                https: None,
            },
            rules(r#"{".*": "http://rule:3"}"#),
        );
        let resolved = resolver.resolve_str("https://example.org/");
        assert_eq!(resolved.map.http.as_deref(), Some("http://plain:2"));
        assert_eq!(resolved.map.https.as_deref(), Some("http://global:1"));
        assert!(resolved.from_overrides);
        assert_eq!(resolved.rule, None);
        assert_eq!(resolved.origin().as_deref(), Some("command line"));
    }

    #[test]
    fn test_rule_fills_scheme_without_override() {
        let resolver = ProxyResolver::new(
            ProxyOverrides {
                proxy: None,
                http: Some("http://plain:2".into()),
                https: None,
            },
            rules(r#"{".*": "http://rule:3"}"#),
        );
        let resolved = resolver.resolve_str("https://example.org/");
        assert_eq!(resolved.map.http.as_deref(), Some("http://plain:2"));
        assert_eq!(resolved.map.https.as_deref(), Some("http://rule:3"));
        assert_eq!(
            resolved.origin().as_deref(),
            Some("command line and matched pattern \".*\"")
        );
    }

    #[test]
    fn test_invalid_pattern_reported() {
        let parsed: ProxyRules = serde_json::from_str(r#"{"ok": "p", "(unclosed": "p"}"#).unwrap();
        let (pattern, _) = parsed.compile().unwrap_err();
        assert_eq!(pattern, "(unclosed");
    }

    #[test]
    fn test_non_object_rejected() {
        assert!(serde_json::from_str::<ProxyRules>(r#"["a", "b"]"#).is_err());
    }
}
