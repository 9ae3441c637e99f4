//! Origin policy evaluation.
//!
//! # Evaluation Order
//!
//! 1. Required headers (missing → 400, regardless of origin)
//! 2. Blacklist (match → 403)
//! 3. Whitelist (empty → allow; otherwise must match → 403)
//!
//! # Pattern Matching
//!
//! - Exact, case-sensitive: `https://app.example.com`
//! - `*` alone matches every origin
//! - `*` inside a pattern matches any run of characters:
//!   `https://*.example.com` matches `https://api.example.com`

use axum::http::{header, HeaderMap, HeaderName, HeaderValue};

use crate::config::CorsConfig;
use crate::error::{ProxyError, ProxyResult};

/// A compiled origin pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OriginPattern {
    Any,
    Exact(String),
    Wildcard(Vec<String>),
}

impl OriginPattern {
    pub fn parse(pattern: &str) -> Self {
        let pattern = pattern.trim();
        if pattern == "*" {
            OriginPattern::Any
        } else if pattern.contains('*') {
            OriginPattern::Wildcard(pattern.split('*').map(str::to_string).collect())
        } else {
            OriginPattern::Exact(pattern.to_string())
        }
    }

    pub fn matches(&self, origin: &str) -> bool {
        match self {
            OriginPattern::Any => true,
            OriginPattern::Exact(expected) => expected == origin,
            OriginPattern::Wildcard(parts) => glob_match(parts, origin),
        }
    }
}

/// `parts` is the pattern split on `*`; there is at least one `*`, so at
/// least two parts.
fn glob_match(parts: &[String], candidate: &str) -> bool {
    let (first, rest) = match parts.split_first() {
        Some(split) => split,
        None => return false,
    };
    let (last, middle) = match rest.split_last() {
        Some(split) => split,
        None => return candidate == first,
    };

    if candidate.len() < first.len() + last.len()
        || !candidate.starts_with(first.as_str())
        || !candidate.ends_with(last.as_str())
    {
        return false;
    }

    let mut remaining = &candidate[first.len()..candidate.len() - last.len()];
    for part in middle {
        match remaining.find(part.as_str()) {
            Some(idx) => remaining = &remaining[idx + part.len()..],
            None => return false,
        }
    }
    true
}

/// Outcome of a successful origin check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginDecision {
    /// The calling origin, if the request sent one.
    pub origin: Option<String>,
}

impl OriginDecision {
    /// Value for `Access-Control-Allow-Origin`.
    pub fn allow_origin_value(&self) -> HeaderValue {
        self.origin
            .as_deref()
            .and_then(|o| HeaderValue::from_str(o).ok())
            .unwrap_or_else(|| HeaderValue::from_static("*"))
    }

    /// True when the response echoes a concrete origin and must vary on it.
    pub fn echoes_origin(&self) -> bool {
        self.origin.is_some()
    }
}

/// Immutable header policy built once from `CorsConfig`.
#[derive(Debug, Clone)]
pub struct CorsPolicy {
    whitelist: Vec<OriginPattern>,
    blacklist: Vec<OriginPattern>,
    require_headers: Vec<HeaderName>,
    pub(crate) remove_headers: Vec<HeaderName>,
    pub(crate) set_headers: Vec<(HeaderName, HeaderValue)>,
    pub(crate) allow_methods: Option<HeaderValue>,
    pub(crate) expose_headers: Option<HeaderValue>,
    pub(crate) max_age: Option<HeaderValue>,
}

impl CorsPolicy {
    /// Compile the policy. Invalid header names and values are skipped with a
    /// warning; `validate_config` rejects them before this point in practice.
    pub fn from_config(config: &CorsConfig) -> Self {
        let whitelist = config.origin_whitelist.iter().map(|p| OriginPattern::parse(p)).collect();
        let blacklist = config.origin_blacklist.iter().map(|p| OriginPattern::parse(p)).collect();

        let set_headers = config
            .set_headers
            .iter()
            .filter_map(|(name, value)| {
                match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
                    (Ok(n), Ok(v)) => Some((n, v)),
                    _ => {
                        tracing::warn!(header = %name, "Ignoring invalid set_headers entry");
                        None
                    }
                }
            })
            .collect();

        Self {
            whitelist,
            blacklist,
            require_headers: header_names(&config.require_headers),
            remove_headers: header_names(&config.remove_headers),
            set_headers,
            allow_methods: joined(&config.allow_methods),
            expose_headers: joined(&config.expose_headers),
            max_age: (config.max_age_secs > 0).then(|| HeaderValue::from(config.max_age_secs)),
        }
    }

    /// Decide whether the request may be proxied.
    pub fn check(&self, headers: &HeaderMap) -> ProxyResult<OriginDecision> {
        if let Some(missing) = self.require_headers.iter().find(|name| !headers.contains_key(*name)) {
            return Err(ProxyError::MissingRequiredHeader(missing.as_str().to_string()));
        }

        let origin = headers
            .get(header::ORIGIN)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        if let Some(origin) = &origin {
            if self.blacklist.iter().any(|p| p.matches(origin)) {
                return Err(ProxyError::OriginNotAllowed(origin.clone()));
            }
        }

        if !self.whitelist.is_empty() {
            let allowed = origin
                .as_deref()
                .map(|o| self.whitelist.iter().any(|p| p.matches(o)))
                .unwrap_or(false);
            if !allowed {
                return Err(ProxyError::OriginNotAllowed(origin.unwrap_or_default()));
            }
        }

        Ok(OriginDecision { origin })
    }

    /// True when every origin is accepted.
    pub fn is_open(&self) -> bool {
        self.whitelist.is_empty() && self.blacklist.is_empty()
    }
}

impl Default for CorsPolicy {
    fn default() -> Self {
        Self::from_config(&CorsConfig::default())
    }
}

fn header_names(names: &[String]) -> Vec<HeaderName> {
    names
        .iter()
        .filter_map(|name| HeaderName::from_bytes(name.as_bytes()).ok())
        .collect()
}

fn joined(values: &[String]) -> Option<HeaderValue> {
    if values.is_empty() {
        return None;
    }
    HeaderValue::from_str(&values.join(", ")).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(
                HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        map
    }

    fn policy(whitelist: &[&str], require: &[&str]) -> CorsPolicy {
        CorsPolicy::from_config(&CorsConfig {
            origin_whitelist: whitelist.iter().map(|s| s.to_string()).collect(),
            require_headers: require.iter().map(|s| s.to_string()).collect(),
            ..CorsConfig::default()
        })
    }

    #[test]
    fn empty_whitelist_allows_everyone() {
        let p = CorsPolicy::default();
        let decision = p.check(&headers(&[("origin", "https://app.test")])).unwrap();
        assert_eq!(decision.origin.as_deref(), Some("https://app.test"));
        assert_eq!(decision.allow_origin_value(), "https://app.test");

        let anonymous = p.check(&HeaderMap::new()).unwrap();
        assert_eq!(anonymous.allow_origin_value(), "*");
        assert!(!anonymous.echoes_origin());
    }

    #[test]
    fn whitelist_exact_is_case_sensitive() {
        let p = policy(&["https://app.test"], &[]);
        assert!(p.check(&headers(&[("origin", "https://app.test")])).is_ok());
        let err = p.check(&headers(&[("origin", "https://APP.test")])).unwrap_err();
        assert!(matches!(err, ProxyError::OriginNotAllowed(_)));
    }

    #[test]
    fn whitelist_wildcard() {
        let p = policy(&["https://*.example.com"], &[]);
        assert!(p.check(&headers(&[("origin", "https://api.example.com")])).is_ok());
        assert!(p.check(&headers(&[("origin", "https://example.com")])).is_err());
        assert!(p.check(&headers(&[("origin", "http://api.example.com")])).is_err());
    }

    #[test]
    fn whitelist_rejects_missing_origin() {
        let p = policy(&["https://app.test"], &[]);
        assert!(matches!(
            p.check(&HeaderMap::new()),
            Err(ProxyError::OriginNotAllowed(_))
        ));
    }

    #[test]
    fn required_header_checked_before_origin() {
        let p = policy(&["https://app.test"], &["x-requested-with"]);
        let err = p.check(&headers(&[("origin", "https://evil.test")])).unwrap_err();
        assert!(matches!(err, ProxyError::MissingRequiredHeader(ref h) if h == "x-requested-with"));

        let ok = p.check(&headers(&[
            ("origin", "https://app.test"),
            ("X-Requested-With", "XMLHttpRequest"),
        ]));
        assert!(ok.is_ok());
    }

    #[test]
    fn blacklist_wins_over_open_whitelist() {
        let p = CorsPolicy::from_config(&CorsConfig {
            origin_blacklist: vec!["https://evil.test".into()],
            ..CorsConfig::default()
        });
        assert!(!p.is_open());
        assert!(p.check(&headers(&[("origin", "https://evil.test")])).is_err());
        assert!(p.check(&headers(&[("origin", "https://good.test")])).is_ok());
    }

    #[test]
    fn glob_patterns() {
        let any = OriginPattern::parse("*");
        assert!(any.matches("anything"));

        let multi = OriginPattern::parse("https://*.corp.*.test");
        assert!(multi.matches("https://a.corp.eu.test"));
        assert!(!multi.matches("https://a.corp.test"));

        let trailing = OriginPattern::parse("http://localhost:*");
        assert!(trailing.matches("http://localhost:3000"));
        assert!(!trailing.matches("http://localhost"));
    }
}
