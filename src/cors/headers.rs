//! Header rewriting on both sides of the proxy.
//!
//! # Request side
//! - Strip hop-by-hop headers and anything named in `Connection`
//! - Strip `Host` (re-derived from the target) and proxy-identifying headers
//! - Strip CORS preflight request headers and the configured remove-set
//! - Apply configured `set_headers`
//!
//! # Response side
//! - Strip hop-by-hop headers, upstream `Access-Control-*` and cookies
//! - Inject `Access-Control-Allow-*` / `Expose-Headers` for the caller

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, Response, StatusCode};

use crate::cors::policy::{CorsPolicy, OriginDecision};

/// Hop-by-hop headers (RFC 9110 §7.6.1) plus the legacy `proxy-connection`.
pub const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Headers that reveal proxies in front of us or the client's network.
pub const PROXY_IDENTIFYING: &[&str] = &[
    "forwarded",
    "via",
    "x-forwarded-for",
    "x-forwarded-host",
    "x-forwarded-proto",
    "x-forwarded-port",
    "x-real-ip",
];

/// Cookies never cross the proxy: they would be scoped to the proxy's host.
pub const RESPONSE_STRIPPED: &[&str] = &["set-cookie", "set-cookie2"];

pub const X_REQUEST_URL: &str = "x-request-url";
pub const X_FINAL_URL: &str = "x-final-url";

/// Debug header recording the n-th redirect followed inside the proxy.
pub fn redirect_header_name(hop: u32) -> Option<HeaderName> {
    HeaderName::from_bytes(format!("x-cors-redirect-{}", hop).as_bytes()).ok()
}

/// CORS-relevant facts about the inbound request, captured before its
/// headers are rewritten.
#[derive(Debug, Clone)]
pub struct CorsContext {
    pub decision: OriginDecision,
    pub request_method: Option<HeaderValue>,
    pub request_headers: Option<HeaderValue>,
}

impl CorsContext {
    pub fn new(decision: OriginDecision, inbound: &HeaderMap) -> Self {
        Self {
            decision,
            request_method: inbound.get(header::ACCESS_CONTROL_REQUEST_METHOD).cloned(),
            request_headers: inbound.get(header::ACCESS_CONTROL_REQUEST_HEADERS).cloned(),
        }
    }
}

/// An `OPTIONS` request announcing the method it wants to use.
pub fn is_preflight(method: &Method, headers: &HeaderMap) -> bool {
    method == Method::OPTIONS && headers.contains_key(header::ACCESS_CONTROL_REQUEST_METHOD)
}

fn remove_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// Build the header set sent upstream.
pub fn prepare_upstream_headers(inbound: &HeaderMap, policy: &CorsPolicy) -> HeaderMap {
    let mut headers = inbound.clone();

    remove_hop_by_hop(&mut headers);
    headers.remove(header::HOST);
    for name in PROXY_IDENTIFYING {
        headers.remove(*name);
    }
    headers.remove(header::ACCESS_CONTROL_REQUEST_METHOD);
    headers.remove(header::ACCESS_CONTROL_REQUEST_HEADERS);
    for name in &policy.remove_headers {
        headers.remove(name);
    }
    for (name, value) in &policy.set_headers {
        headers.insert(name.clone(), value.clone());
    }

    headers
}

/// Remove upstream headers that must not reach the browser.
pub fn strip_response_headers(headers: &mut HeaderMap) {
    remove_hop_by_hop(headers);
    for name in RESPONSE_STRIPPED {
        headers.remove(*name);
    }
    let upstream_cors: Vec<HeaderName> = headers
        .keys()
        .filter(|name| name.as_str().starts_with("access-control-"))
        .cloned()
        .collect();
    for name in upstream_cors {
        headers.remove(name);
    }
}

/// Inject CORS headers into a response header map.
pub fn apply_cors(headers: &mut HeaderMap, ctx: &CorsContext, policy: &CorsPolicy, preflight: bool) {
    let expose = if preflight {
        None
    } else {
        policy.expose_headers.clone().or_else(|| exposed_names(headers))
    };

    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, ctx.decision.allow_origin_value());
    if ctx.decision.echoes_origin() {
        headers.append(header::VARY, HeaderValue::from_static("origin"));
    }

    if let Some(methods) = policy.allow_methods.clone().or_else(|| ctx.request_method.clone()) {
        headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, methods);
    }
    if let Some(requested) = ctx.request_headers.clone() {
        headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, requested);
    }
    if preflight {
        if let Some(max_age) = policy.max_age.clone() {
            headers.insert(header::ACCESS_CONTROL_MAX_AGE, max_age);
        }
    }
    if let Some(expose) = expose {
        headers.insert(header::ACCESS_CONTROL_EXPOSE_HEADERS, expose);
    }
}

/// Comma-separated list of the response's own header names.
fn exposed_names(headers: &HeaderMap) -> Option<HeaderValue> {
    let names: Vec<&str> = headers.keys().map(HeaderName::as_str).collect();
    if names.is_empty() {
        return None;
    }
    HeaderValue::from_str(&names.join(",")).ok()
}

/// Synthesize the answer to a CORS preflight. No upstream call is made.
pub fn preflight_response(ctx: &CorsContext, policy: &CorsPolicy) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    apply_cors(response.headers_mut(), ctx, policy, true);
    response
}

/// Point a pass-through redirect back at the proxy so the browser keeps
/// going through it.
pub fn proxied_location(proxy_base: &str, absolute_location: &str) -> Option<HeaderValue> {
    HeaderValue::from_str(&format!("{}/{}", proxy_base.trim_end_matches('/'), absolute_location)).ok()
}
