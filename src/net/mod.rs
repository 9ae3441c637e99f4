//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! listener.rs (bind configured address)
//!     → axum::serve accept loop (one task per connection)
//!     → Hand off to HTTP layer
//! ```
//!
//! # Design Decisions
//! - Plain HTTP only; TLS is terminated in front of the proxy
//! - Bind failure is the one process-fatal runtime error

pub mod listener;

pub use listener::{bind, ListenerError};
