//! Concurrency guard with bounded queueing.
//!
//! # Responsibilities
//! - Bound the number of proxied requests in flight
//! - Reject or queue (bounded) requests beyond the bound
//! - Release the slot when the request's response is finished
//!
//! # Design Decisions
//! - A semaphore holds the in-flight bound; permits are RAII and released
//!   even if the handler panics or the client disconnects
//! - The queue is a counter, admitted with a CAS loop, so it can never
//!   overshoot `queue_depth` under concurrent arrivals

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::{LimitsConfig, OverflowPolicy};
use crate::error::{ProxyError, ProxyResult};
use crate::observability::metrics;

/// Shared admission state.
#[derive(Debug)]
pub struct ConcurrencyGuard {
    slots: Arc<Semaphore>,
    max_concurrent: usize,
    in_flight: Arc<AtomicUsize>,
    queued: AtomicUsize,
    overflow: OverflowPolicy,
    queue_depth: usize,
    queue_timeout: Duration,
}

impl ConcurrencyGuard {
    pub fn new(config: &LimitsConfig) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(config.max_concurrent)),
            max_concurrent: config.max_concurrent,
            in_flight: Arc::new(AtomicUsize::new(0)),
            queued: AtomicUsize::new(0),
            overflow: config.overflow,
            queue_depth: config.queue_depth,
            queue_timeout: Duration::from_millis(config.queue_timeout_ms),
        }
    }

    /// Admit one request or fail with `CapacityExceeded`.
    pub async fn admit(&self) -> ProxyResult<AdmissionPermit> {
        if let Ok(permit) = self.slots.clone().try_acquire_owned() {
            return Ok(self.grant(permit));
        }

        let slot = match self.overflow {
            OverflowPolicy::Queue => self.try_enqueue(),
            OverflowPolicy::Reject => None,
        };
        let Some(slot) = slot else {
            metrics::record_rejected("capacity");
            return Err(ProxyError::CapacityExceeded);
        };

        // The slot is released on drop, including when this future is cancelled.
        let waited = tokio::time::timeout(self.queue_timeout, self.slots.clone().acquire_owned()).await;
        drop(slot);

        match waited {
            Ok(Ok(permit)) => Ok(self.grant(permit)),
            Ok(Err(_closed)) => Err(ProxyError::CapacityExceeded),
            Err(_) => {
                tracing::debug!(timeout = ?self.queue_timeout, "Queued request gave up waiting");
                metrics::record_rejected("queue_timeout");
                Err(ProxyError::CapacityExceeded)
            }
        }
    }

    fn try_enqueue(&self) -> Option<QueueSlot<'_>> {
        let mut current = self.queued.load(Ordering::SeqCst);
        loop {
            if current >= self.queue_depth {
                return None;
            }
            match self.queued.compare_exchange_weak(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Some(QueueSlot { queued: &self.queued }),
                Err(actual) => current = actual,
            }
        }
    }

    fn grant(&self, permit: OwnedSemaphorePermit) -> AdmissionPermit {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::set_in_flight(now);
        AdmissionPermit {
            _permit: permit,
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    /// Requests currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Requests currently waiting for a slot.
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }
}

/// A place in the wait queue.
struct QueueSlot<'a> {
    queued: &'a AtomicUsize,
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.queued.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A held in-flight slot. Dropping it releases the slot.
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        let now = self.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::set_in_flight(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(max: usize, overflow: OverflowPolicy, depth: usize, timeout_ms: u64) -> LimitsConfig {
        LimitsConfig {
            max_concurrent: max,
            overflow,
            queue_depth: depth,
            queue_timeout_ms: timeout_ms,
            ..LimitsConfig::default()
        }
    }

    #[tokio::test]
    async fn reject_policy_bounds_in_flight() {
        let guard = ConcurrencyGuard::new(&limits(2, OverflowPolicy::Reject, 0, 0));

        let a = guard.admit().await.unwrap();
        let b = guard.admit().await.unwrap();
        assert_eq!(guard.in_flight(), 2);

        let third = guard.admit().await;
        assert!(matches!(third, Err(ProxyError::CapacityExceeded)));
        assert_eq!(guard.in_flight(), 2);

        drop(a);
        assert_eq!(guard.in_flight(), 1);
        let _c = guard.admit().await.unwrap();
        drop(b);
    }

    #[tokio::test]
    async fn queue_admits_when_slot_frees() {
        let guard = Arc::new(ConcurrencyGuard::new(&limits(1, OverflowPolicy::Queue, 1, 1_000)));
        let held = guard.admit().await.unwrap();

        let waiter = {
            let guard = guard.clone();
            tokio::spawn(async move { guard.admit().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(guard.queued(), 1);

        // Queue is full: the next arrival is refused immediately.
        assert!(matches!(guard.admit().await, Err(ProxyError::CapacityExceeded)));

        drop(held);
        assert!(waiter.await.unwrap().is_ok());
        assert_eq!(guard.queued(), 0);
    }

    #[tokio::test]
    async fn cancelled_waiter_gives_back_its_queue_place() {
        let guard = Arc::new(ConcurrencyGuard::new(&limits(1, OverflowPolicy::Queue, 1, 5_000)));
        let held = guard.admit().await.unwrap();

        let waiter = {
            let guard = guard.clone();
            tokio::spawn(async move { guard.admit().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(guard.queued(), 1);

        waiter.abort();
        assert!(waiter.await.unwrap_err().is_cancelled());
        assert_eq!(guard.queued(), 0);

        // The freed place can be taken by the next overflow arrival.
        let next = {
            let guard = guard.clone();
            tokio::spawn(async move { guard.admit().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(guard.queued(), 1);

        drop(held);
        assert!(next.await.unwrap().is_ok());
        assert_eq!(guard.queued(), 0);
        assert_eq!(guard.in_flight(), 0);
    }

    #[tokio::test]
    async fn queue_wait_times_out() {
        let guard = ConcurrencyGuard::new(&limits(1, OverflowPolicy::Queue, 4, 50));
        let _held = guard.admit().await.unwrap();

        let started = std::time::Instant::now();
        assert!(matches!(guard.admit().await, Err(ProxyError::CapacityExceeded)));
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(guard.queued(), 0);
    }

    #[tokio::test]
    async fn bound_holds_under_concurrent_admission() {
        let guard = Arc::new(ConcurrencyGuard::new(&limits(4, OverflowPolicy::Reject, 0, 0)));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..64 {
            let guard = guard.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                if let Ok(permit) = guard.admit().await {
                    peak.fetch_max(guard.in_flight(), Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    drop(permit);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 4);
        assert_eq!(guard.in_flight(), 0);
    }
}
