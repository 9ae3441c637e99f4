//! Configuration validation.
//!
//! Serde handles syntax; this pass checks value ranges and that every
//! header name and origin pattern is usable. All errors are collected so an
//! operator sees the whole list at once.

use std::net::SocketAddr;

use axum::http::{HeaderName, HeaderValue};
use thiserror::Error;

use crate::config::schema::{OverflowPolicy, ProxyConfig};

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field}: invalid socket address \"{value}\"")]
    InvalidAddress { field: &'static str, value: String },

    #[error("{field}: invalid header name \"{value}\"")]
    InvalidHeaderName { field: &'static str, value: String },

    #[error("cors.set_headers: invalid value for \"{0}\"")]
    InvalidHeaderValue(String),

    #[error("{field}: empty origin pattern")]
    EmptyPattern { field: &'static str },

    #[error("{0} must be greater than zero")]
    MustBePositive(&'static str),
}

/// Validate a parsed configuration.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    check_address(&mut errors, "listener.bind_address", &config.listener.bind_address);
    if config.observability.metrics_enabled {
        check_address(
            &mut errors,
            "observability.metrics_address",
            &config.observability.metrics_address,
        );
    }

    for name in &config.cors.require_headers {
        check_header_name(&mut errors, "cors.require_headers", name);
    }
    for name in &config.cors.remove_headers {
        check_header_name(&mut errors, "cors.remove_headers", name);
    }
    for name in &config.cors.expose_headers {
        check_header_name(&mut errors, "cors.expose_headers", name);
    }
    for (name, value) in &config.cors.set_headers {
        check_header_name(&mut errors, "cors.set_headers", name);
        if HeaderValue::from_str(value).is_err() {
            errors.push(ValidationError::InvalidHeaderValue(name.clone()));
        }
    }

    for pattern in &config.cors.origin_whitelist {
        if pattern.trim().is_empty() {
            errors.push(ValidationError::EmptyPattern { field: "cors.origin_whitelist" });
        }
    }
    for pattern in &config.cors.origin_blacklist {
        if pattern.trim().is_empty() {
            errors.push(ValidationError::EmptyPattern { field: "cors.origin_blacklist" });
        }
    }

    let positive = [
        ("timeouts.connect_ms", config.timeouts.connect_ms as usize),
        ("timeouts.request_ms", config.timeouts.request_ms as usize),
        ("timeouts.idle_ms", config.timeouts.idle_ms as usize),
        ("limits.max_concurrent", config.limits.max_concurrent),
        ("limits.max_body_bytes", config.limits.max_body_bytes),
    ];
    for (field, value) in positive {
        if value == 0 {
            errors.push(ValidationError::MustBePositive(field));
        }
    }

    if config.limits.overflow == OverflowPolicy::Queue {
        if config.limits.queue_depth == 0 {
            errors.push(ValidationError::MustBePositive("limits.queue_depth"));
        }
        if config.limits.queue_timeout_ms == 0 {
            errors.push(ValidationError::MustBePositive("limits.queue_timeout_ms"));
        }
    }

    if config.rate_limit.enabled {
        if config.rate_limit.requests_per_second == 0 {
            errors.push(ValidationError::MustBePositive("rate_limit.requests_per_second"));
        }
        if config.rate_limit.burst_size == 0 {
            errors.push(ValidationError::MustBePositive("rate_limit.burst_size"));
        }
        if config.rate_limit.max_tracked_clients == 0 {
            errors.push(ValidationError::MustBePositive("rate_limit.max_tracked_clients"));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_address(errors: &mut Vec<ValidationError>, field: &'static str, value: &str) {
    if value.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidAddress {
            field,
            value: value.to_string(),
        });
    }
}

fn check_header_name(errors: &mut Vec<ValidationError>, field: &'static str, value: &str) {
    if HeaderName::from_bytes(value.as_bytes()).is_err() {
        errors.push(ValidationError::InvalidHeaderName {
            field,
            value: value.to_string(),
        });
    }
}
