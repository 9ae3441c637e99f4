//! Request identity and lifecycle tracking.
//!
//! # Responsibilities
//! - Generate a UUID v4 `x-request-id` for every inbound request
//! - Track each request through its state machine for logging
//! - Hold the admission permit until the request is closed
//!
//! # States
//! ```text
//! Received → TargetResolved → OriginChecked
//!     → PreflightResponded → Closed
//!     → Forwarding → ResponseStreaming → Closed
//! any failure → Closed
//! ```

use std::time::Instant;

use axum::http::{header, HeaderMap, HeaderValue, Request};
use tower_http::request_id::{MakeRequestId, RequestId};
use uuid::Uuid;

use crate::security::AdmissionPermit;

pub const X_REQUEST_ID: &str = "x-request-id";

/// Generates UUID v4 request ids for `SetRequestIdLayer`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MakeRequestUuidV4;

impl MakeRequestId for MakeRequestUuidV4 {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<RequestId> {
        HeaderValue::from_str(&Uuid::new_v4().to_string())
            .ok()
            .map(RequestId::new)
    }
}

/// Read the request id set by the request-id layer.
pub fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string()
}

/// Public base URL of this proxy as seen by the caller, used to rewrite
/// redirect locations. Honors `x-forwarded-proto` from a TLS front end.
pub fn proxy_base(headers: &HeaderMap) -> String {
    let https = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_start().to_ascii_lowercase().starts_with("https"))
        .unwrap_or(false);
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    format!("{}://{}", if https { "https" } else { "http" }, host)
}

/// Per-request state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Received,
    TargetResolved,
    OriginChecked,
    PreflightResponded,
    Forwarding,
    ResponseStreaming,
    Closed,
}

impl RequestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestState::Received => "received",
            RequestState::TargetResolved => "target_resolved",
            RequestState::OriginChecked => "origin_checked",
            RequestState::PreflightResponded => "preflight_responded",
            RequestState::Forwarding => "forwarding",
            RequestState::ResponseStreaming => "response_streaming",
            RequestState::Closed => "closed",
        }
    }

    /// Transitions never go backwards; failures may jump to `Closed` from anywhere.
    pub fn can_advance_to(&self, next: RequestState) -> bool {
        use RequestState::*;
        matches!(
            (self, next),
            (_, Closed)
                | (Received, TargetResolved)
                | (TargetResolved, OriginChecked)
                | (OriginChecked, PreflightResponded)
                | (OriginChecked, Forwarding)
                | (Forwarding, ResponseStreaming)
        ) && *self != Closed
    }
}

impl std::fmt::Display for RequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of one proxied request.
///
/// Owns the admission permit; dropping it (when the response body finishes
/// or the client goes away) closes the request and frees the slot.
#[derive(Debug)]
pub struct RequestLifecycle {
    request_id: String,
    state: RequestState,
    started: Instant,
    _permit: Option<AdmissionPermit>,
}

impl RequestLifecycle {
    pub fn new(request_id: String) -> Self {
        tracing::debug!(request_id = %request_id, state = %RequestState::Received, "Request state");
        Self {
            request_id,
            state: RequestState::Received,
            started: Instant::now(),
            _permit: None,
        }
    }

    pub fn admitted(&mut self, permit: AdmissionPermit) {
        self._permit = Some(permit);
    }

    pub fn advance(&mut self, next: RequestState) {
        debug_assert!(self.state.can_advance_to(next), "{} -> {}", self.state, next);
        tracing::debug!(request_id = %self.request_id, from = %self.state, state = %next, "Request state");
        self.state = next;
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn started(&self) -> Instant {
        self.started
    }
}

impl Drop for RequestLifecycle {
    fn drop(&mut self) {
        tracing::debug!(
            request_id = %self.request_id,
            from = %self.state,
            state = %RequestState::Closed,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "Request state"
        );
    }
}
