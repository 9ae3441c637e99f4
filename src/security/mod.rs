//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request:
//!     → guard.rs (in-flight bound, bounded queue → 429)
//!     → rate_limit.rs (per-origin token bucket → 429)
//!     → Pass to target resolution and origin policy
//! ```
//!
//! # Design Decisions
//! - Admission happens before any parsing so overload costs little
//! - Fail closed: a request that cannot be admitted gets an answer, not a wait

pub mod guard;
pub mod rate_limit;

pub use guard::{AdmissionPermit, ConcurrencyGuard};
pub use rate_limit::RateLimiter;
