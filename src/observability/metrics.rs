//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_requests_total` (counter): requests by method, status, outcome
//! - `proxy_request_duration_seconds` (histogram): time to response headers
//! - `proxy_in_flight` (gauge): admitted requests currently streaming
//! - `proxy_rejected_total` (counter): capacity/rate-limit rejections by reason
//! - `proxy_redirects_followed_total` (counter): redirects followed in-proxy
//!
//! Recording goes through the `metrics` facade and is a no-op until an
//! exporter is installed.

use std::net::SocketAddr;
use std::time::Instant;

use axum::http::Method;
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter and its scrape listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

/// Label for a request method. Extension methods collapse into `other` so
/// callers cannot create label values at will.
pub fn method_label(method: &Method) -> &'static str {
    match method.as_str() {
        "GET" => "GET",
        "HEAD" => "HEAD",
        "POST" => "POST",
        "PUT" => "PUT",
        "DELETE" => "DELETE",
        "PATCH" => "PATCH",
        "OPTIONS" => "OPTIONS",
        "CONNECT" => "CONNECT",
        "TRACE" => "TRACE",
        _ => "other",
    }
}

/// Record a finished request.
pub fn record_request(method: &Method, status: u16, outcome: &'static str, start: Instant) {
    metrics::counter!(
        "proxy_requests_total",
        "method" => method_label(method),
        "status" => status.to_string(),
        "outcome" => outcome
    )
    .increment(1);
    metrics::histogram!("proxy_request_duration_seconds", "outcome" => outcome)
        .record(start.elapsed().as_secs_f64());
}

pub fn set_in_flight(count: usize) {
    metrics::gauge!("proxy_in_flight").set(count as f64);
}

pub fn record_rejected(reason: &'static str) {
    metrics::counter!("proxy_rejected_total", "reason" => reason).increment(1);
}

pub fn record_redirect() {
    metrics::counter!("proxy_redirects_followed_total").increment(1);
}
