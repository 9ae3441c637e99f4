//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, middleware, proxy handler)
//!     → request.rs (request ID, lifecycle state machine)
//!     → [cors + forward subsystems]
//!     → response.rs (rewrite upstream response, render errors)
//!     → Send to client
//! ```

pub mod request;
pub mod response;
pub mod server;

pub use request::{MakeRequestUuidV4, RequestLifecycle, RequestState, X_REQUEST_ID};
pub use server::{AppState, HttpServer};
