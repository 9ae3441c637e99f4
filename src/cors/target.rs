//! Target URL extraction.
//!
//! # Responsibilities
//! - Pull the absolute target URL out of `/<url>[?query]`
//! - Accept only `http` and `https` with a non-empty host
//! - Resolve redirect `Location` headers against the current target
//! - Optionally refuse loopback/private IP targets
//!
//! # Design Decisions
//! - No scheme guessing: `/example.com/x` is rejected, not rewritten
//! - Redirect hops go through the same validation as the first target

use std::net::IpAddr;

use axum::http::Uri;
use url::{Host, Url};

use crate::error::{ProxyError, ProxyResult};

/// Resolver settings derived from `ForwardingConfig`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TargetPolicy {
    /// Refuse `localhost` and non-public IP literals.
    pub deny_private: bool,
}

/// A validated upstream target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    url: Url,
}

impl Target {
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    /// `scheme://host[:port]` of the target.
    pub fn origin(&self) -> String {
        self.url.origin().ascii_serialization()
    }

    /// Convert to an `http::Uri` for the outbound request.
    pub fn to_uri(&self) -> ProxyResult<Uri> {
        self.url
            .as_str()
            .parse::<Uri>()
            .map_err(|e| ProxyError::InvalidTarget(format!("{}: {}", self.url, e)))
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.url.as_str())
    }
}

/// Extract the target from an inbound path-and-query such as
/// `/https://example.com/data?x=1`.
pub fn resolve(path_and_query: &str, policy: TargetPolicy) -> ProxyResult<Target> {
    let raw = path_and_query.strip_prefix('/').unwrap_or(path_and_query);
    if raw.is_empty() {
        return Err(ProxyError::InvalidTarget("missing target URL".into()));
    }

    let lower = raw.get(..8).unwrap_or(raw).to_ascii_lowercase();
    if !(lower.starts_with("http://") || lower.starts_with("https://")) {
        return Err(ProxyError::InvalidTarget(format!(
            "\"{}\" must start with http:// or https://",
            raw
        )));
    }

    let url = Url::parse(raw).map_err(|e| ProxyError::InvalidTarget(format!("\"{}\": {}", raw, e)))?;
    validate(url, policy)
}

/// Resolve a redirect `Location` relative to the target that produced it.
pub fn resolve_location(base: &Target, location: &str, policy: TargetPolicy) -> ProxyResult<Target> {
    let url = base
        .url
        .join(location)
        .map_err(|e| ProxyError::InvalidTarget(format!("redirect to \"{}\": {}", location, e)))?;
    validate(url, policy)
}

fn validate(url: Url, policy: TargetPolicy) -> ProxyResult<Target> {
    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(ProxyError::InvalidTarget(format!("unsupported scheme \"{}\"", other)));
        }
    }

    let host = match url.host() {
        Some(host) => host,
        None => return Err(ProxyError::InvalidTarget(format!("\"{}\" has no host", url))),
    };
    if let Host::Domain(domain) = &host {
        if domain.is_empty() {
            return Err(ProxyError::InvalidTarget(format!("\"{}\" has no host", url)));
        }
    }

    if policy.deny_private && is_private_host(&host) {
        return Err(ProxyError::InvalidTarget(format!(
            "\"{}\" points at a private address",
            url
        )));
    }

    Ok(Target { url })
}

fn is_private_host(host: &Host<&str>) -> bool {
    match host {
        Host::Domain(domain) => {
            let domain = domain.trim_end_matches('.').to_ascii_lowercase();
            domain == "localhost" || domain.ends_with(".localhost")
        }
        Host::Ipv4(ip) => is_private_ip(IpAddr::V4(*ip)),
        Host::Ipv6(ip) => is_private_ip(IpAddr::V6(*ip)),
    }
}

pub(crate) fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                // 100.64.0.0/10 carrier-grade NAT
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xc0) == 64)
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_private_ip(IpAddr::V4(mapped));
            }
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xfe00) == 0xfc00
                || (first & 0xffc0) == 0xfe80
        }
    }
}
