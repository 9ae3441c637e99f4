//! Per-client rate limiting.
//!
//! Requests are keyed by the peer IP. `Origin` is chosen by the caller, so
//! it only decides exemptions and never selects a bucket. Each client gets
//! a token bucket refilled at `requests_per_second` up to `burst_size`.
//!
//! The bucket table is capped at `max_tracked_clients`. A bucket that has
//! refilled completely carries no state and may be dropped; when the table
//! is full and no such bucket exists, new clients are refused.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::config::RateLimitConfig;
use crate::error::{ProxyError, ProxyResult};
use crate::observability::metrics;

/// Minimum gap between two sweeps of the bucket table.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// A simple token bucket rate limiter.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn new(capacity: f64) -> Self {
        Self {
            tokens: capacity,
            last_update: Instant::now(),
        }
    }

    fn try_acquire(&mut self, capacity: f64, refill_rate: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();

        self.tokens = (self.tokens + elapsed * refill_rate).min(capacity);
        self.last_update = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Shared limiter state.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: DashMap<IpAddr, TokenBucket>,
    exempt: HashSet<String>,
    enabled: bool,
    rps: f64,
    burst: f64,
    max_clients: usize,
    /// Time for an empty bucket to refill; idle longer than this, it is full.
    refill_time: Duration,
    last_sweep: Mutex<Instant>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let rps = config.requests_per_second.max(1) as f64;
        let burst = config.burst_size as f64;
        Self {
            buckets: DashMap::new(),
            exempt: config.exempt_origins.iter().cloned().collect(),
            enabled: config.enabled,
            rps,
            burst,
            max_clients: config.max_tracked_clients,
            refill_time: Duration::from_secs_f64(burst / rps),
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    /// Charge one request to `client`, unless `origin` is exempt.
    pub fn check(&self, origin: Option<&str>, client: IpAddr) -> ProxyResult<()> {
        if !self.enabled {
            return Ok(());
        }
        if let Some(origin) = origin {
            if self.exempt.contains(origin) {
                return Ok(());
            }
        }

        if !self.buckets.contains_key(&client) && self.buckets.len() >= self.max_clients {
            self.sweep();
            if self.buckets.len() >= self.max_clients {
                tracing::warn!(client = %client, tracked = self.buckets.len(), "Rate limit table full");
                metrics::record_rejected("rate_limit_table_full");
                return Err(ProxyError::RateLimited(client.to_string()));
            }
        }

        let allowed = self
            .buckets
            .entry(client)
            .or_insert_with(|| TokenBucket::new(self.burst))
            .try_acquire(self.burst, self.rps);

        if allowed {
            Ok(())
        } else {
            tracing::warn!(client = %client, origin = origin.unwrap_or("-"), "Rate limit exceeded");
            metrics::record_rejected("rate_limit");
            Err(ProxyError::RateLimited(client.to_string()))
        }
    }

    /// Number of clients currently tracked.
    pub fn tracked(&self) -> usize {
        self.buckets.len()
    }

    /// Drop buckets that have refilled completely. Runs at most once per
    /// `SWEEP_INTERVAL`; concurrent callers skip instead of waiting.
    fn sweep(&self) {
        let Ok(mut last) = self.last_sweep.try_lock() else {
            return;
        };
        let now = Instant::now();
        if now.duration_since(*last) < SWEEP_INTERVAL {
            return;
        }
        *last = now;

        let refill_time = self.refill_time;
        self.buckets
            .retain(|_, bucket| now.duration_since(bucket.last_update) < refill_time);
    }
}
