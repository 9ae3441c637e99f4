//! CORS subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request (path, headers)
//!     → target.rs (extract and validate the absolute target URL)
//!     → policy.rs (required headers, origin black/whitelist)
//!     → headers.rs (rewrite request headers / synthesize preflight)
//!     → [forwarding engine]
//!     → headers.rs (strip upstream headers, inject Access-Control-*)
//! ```
//!
//! # Design Decisions
//! - Policy compiled once at startup, immutable at runtime
//! - Origin decision always precedes any upstream I/O
//! - Preflights never reach the target

pub mod headers;
pub mod policy;
pub mod target;

pub use headers::{CorsContext, is_preflight};
pub use policy::{CorsPolicy, OriginDecision, OriginPattern};
pub use target::{Target, TargetPolicy};
