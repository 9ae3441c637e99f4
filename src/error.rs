//! Request-scoped proxy errors.
//!
//! Every failure a single proxied request can hit maps to one variant here.
//! None of them are fatal to the process; each renders as an HTTP status
//! with a small JSON body so browser code can read the reason.

use axum::http::StatusCode;
use thiserror::Error;

/// Error produced while handling one proxied request.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The path did not carry a usable absolute http(s) URL.
    #[error("invalid target URL: {0}")]
    InvalidTarget(String),

    /// A header from the configured required set was absent.
    #[error("missing required request header: {0}")]
    MissingRequiredHeader(String),

    /// The calling origin is not permitted to use this proxy.
    #[error("the origin \"{0}\" is not allowed by the operator of this proxy")]
    OriginNotAllowed(String),

    /// Connecting to or talking with the target failed.
    #[error("upstream {target} unreachable: {message}")]
    UpstreamUnreachable {
        /// Target URL we tried to reach.
        target: String,
        /// Underlying error text.
        message: String,
    },

    /// Connect or response deadline elapsed.
    #[error("upstream {0} timed out")]
    UpstreamTimeout(String),

    /// The redirect chain was longer than `forwarding.max_redirects`.
    #[error("too many redirects (limit {limit}) while fetching {target}")]
    TooManyRedirects {
        /// Configured redirect limit.
        limit: u32,
        /// Last target in the chain.
        target: String,
    },

    /// The in-flight bound (and queue, if any) is exhausted.
    #[error("proxy is at capacity, try again later")]
    CapacityExceeded,

    /// Per-origin token bucket is empty.
    #[error("rate limit exceeded for {0}")]
    RateLimited(String),

    /// The request body is larger than `limits.max_body_bytes`.
    #[error("request body exceeds the {0} byte limit")]
    PayloadTooLarge(usize),

    /// Building the outbound request failed.
    #[error("internal proxy error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// HTTP status returned to the client.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::InvalidTarget(_) => StatusCode::BAD_REQUEST,
            ProxyError::MissingRequiredHeader(_) => StatusCode::BAD_REQUEST,
            ProxyError::OriginNotAllowed(_) => StatusCode::FORBIDDEN,
            ProxyError::UpstreamUnreachable { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::TooManyRedirects { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::CapacityExceeded => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable error kind, used in bodies and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::InvalidTarget(_) => "InvalidTarget",
            ProxyError::MissingRequiredHeader(_) => "MissingRequiredHeader",
            ProxyError::OriginNotAllowed(_) => "OriginNotAllowed",
            ProxyError::UpstreamUnreachable { .. } => "UpstreamUnreachable",
            ProxyError::UpstreamTimeout(_) => "UpstreamTimeout",
            ProxyError::TooManyRedirects { .. } => "TooManyRedirects",
            ProxyError::CapacityExceeded => "CapacityExceeded",
            ProxyError::RateLimited(_) => "RateLimited",
            ProxyError::PayloadTooLarge(_) => "PayloadTooLarge",
            ProxyError::Internal(_) => "Internal",
        }
    }
}

/// Result alias for request handling.
pub type ProxyResult<T> = Result<T, ProxyError>;
