//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the CORS proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (bind address).
    pub listener: ListenerConfig,

    /// Origin policy and header rewriting.
    pub cors: CorsConfig,

    /// Upstream forwarding behaviour.
    pub forwarding: ForwardingConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Concurrency bound and body limits.
    pub limits: LimitsConfig,

    /// Per-origin rate limiting.
    pub rate_limit: RateLimitConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Startup and shutdown settings.
    pub lifecycle: LifecycleConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Origin policy and header rewriting rules.
///
/// Empty lists mean "no restriction", which is the fully open proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct CorsConfig {
    /// Origins allowed to use the proxy. Exact or `*` wildcard patterns.
    pub origin_whitelist: Vec<String>,

    /// Origins always refused, checked before the whitelist.
    pub origin_blacklist: Vec<String>,

    /// Headers every inbound request must carry.
    pub require_headers: Vec<String>,

    /// Headers stripped before forwarding.
    pub remove_headers: Vec<String>,

    /// Headers set on every forwarded request.
    pub set_headers: BTreeMap<String, String>,

    /// `Access-Control-Allow-Methods` value. Empty echoes the preflight.
    pub allow_methods: Vec<String>,

    /// `Access-Control-Expose-Headers` value. Empty exposes every response header.
    pub expose_headers: Vec<String>,

    /// `Access-Control-Max-Age` on preflight responses (0 = omit).
    pub max_age_secs: u64,
}

/// Forwarding configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ForwardingConfig {
    /// Maximum redirects followed inside the proxy.
    pub max_redirects: u32,

    /// Refuse loopback, private and link-local IP targets.
    pub deny_private_targets: bool,
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            max_redirects: 5,
            deny_private_targets: false,
        }
    }
}

/// Timeout configuration for various operations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Upstream connection establishment timeout in milliseconds.
    pub connect_ms: u64,

    /// Total transfer deadline (request sent, response streamed) in milliseconds.
    pub request_ms: u64,

    /// Maximum gap between body chunks in milliseconds.
    pub idle_ms: u64,
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    pub fn request(&self) -> Duration {
        Duration::from_millis(self.request_ms)
    }

    pub fn idle(&self) -> Duration {
        Duration::from_millis(self.idle_ms)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: 5_000,
            request_ms: 30_000,
            idle_ms: 60_000,
        }
    }
}

/// What to do with a request arriving while the proxy is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Answer 429 immediately.
    Reject,
    /// Wait in a bounded queue, then 429.
    Queue,
}

/// Concurrency and size limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum proxied requests in flight.
    pub max_concurrent: usize,

    /// Behaviour when `max_concurrent` is reached.
    pub overflow: OverflowPolicy,

    /// Maximum requests waiting for a slot (queue policy only).
    pub queue_depth: usize,

    /// How long a queued request waits before giving up, in milliseconds.
    pub queue_timeout_ms: u64,

    /// Maximum inbound body size in bytes.
    pub max_body_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 1024,
            overflow: OverflowPolicy::Reject,
            queue_depth: 0,
            queue_timeout_ms: 5_000,
            max_body_bytes: 64 * 1024 * 1024,
        }
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting.
    pub enabled: bool,

    /// Sustained requests per second per client IP.
    pub requests_per_second: u32,

    /// Burst capacity.
    pub burst_size: u32,

    /// Origins never rate limited (exact match).
    pub exempt_origins: Vec<String>,

    /// Most client buckets tracked at once; new clients beyond this are
    /// refused until idle buckets can be dropped.
    pub max_tracked_clients: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            requests_per_second: 50,
            burst_size: 100,
            exempt_origins: Vec::new(),
            max_tracked_clients: 100_000,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log line format.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

/// Lifecycle configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// How long in-flight requests may drain after a shutdown signal.
    pub drain_timeout_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            drain_timeout_secs: 30,
        }
    }
}
