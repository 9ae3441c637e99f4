//! CORS relay: an HTTP proxy that adds CORS headers to any upstream response.
//!
//! A request for `/<absolute-url>` is forwarded to `<absolute-url>`; the
//! upstream response is streamed back with `Access-Control-*` headers so a
//! browser page on any origin can read it.

pub mod config;
pub mod cors;
pub mod error;
pub mod forward;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod security;

pub use config::schema::ProxyConfig;
pub use error::{ProxyError, ProxyResult};
pub use http::HttpServer;
pub use lifecycle::Shutdown;
