//! Forwarding subsystem.
//!
//! # Data Flow
//! ```text
//! Validated target + rewritten headers + inbound body
//!     → engine.rs (send, follow redirects, classify failures)
//!     → client.rs (pooled hyper client, http and https)
//!     → body.rs (idle/total timeouts on both body streams)
//!     → upstream response, body still streaming
//! ```

pub mod body;
pub mod client;
pub mod engine;

pub use engine::{ForwardRequest, Forwarded, Forwarder, RedirectHop};
