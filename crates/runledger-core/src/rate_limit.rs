// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-tenant token bucket.
//!
//! Each tenant gets its own bucket, created full on first use and refilled
//! continuously from the injected clock:
//!
//! ```text
//! tokens = min(capacity, tokens + elapsed_seconds * refill_per_second)
//! ```
//!
//! Acquisition is all-or-nothing. A request larger than the capacity can never
//! succeed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use crate::clock::Clock;

/// Token bucket parameters shared by all tenants.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitConfig {
    /// Maximum tokens a bucket holds.
    pub capacity: f64,
    /// Tokens added per second of elapsed time.
    pub refill_per_second: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 1000.0,
            refill_per_second: 100.0,
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: DateTime<Utc>,
}

/// Per-tenant token bucket rate limiter.
pub struct TenantRateLimiter {
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl TenantRateLimiter {
    /// Create a limiter reading time from `clock`.
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Limiter parameters.
    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Take `count` tokens from the tenant's bucket. Returns false, leaving the
    /// bucket untouched, when not enough tokens are available.
    pub fn try_acquire(&self, tenant_id: &str, count: u32) -> bool {
        let requested = f64::from(count);
        if requested > self.config.capacity {
            return false;
        }

        let now = self.clock.now();
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let bucket = buckets
            .entry(tenant_id.to_string())
            .or_insert_with(|| Bucket {
                tokens: self.config.capacity,
                last_refill: now,
            });

        let elapsed = (now - bucket.last_refill).num_milliseconds().max(0) as f64 / 1000.0;
        bucket.tokens =
            (bucket.tokens + elapsed * self.config.refill_per_second).min(self.config.capacity);
        bucket.last_refill = now;

        if bucket.tokens < requested {
            return false;
        }
        bucket.tokens -= requested;
        true
    }

    /// Tokens currently available to a tenant, without refilling.
    pub fn available(&self, tenant_id: &str) -> f64 {
        let buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        buckets
            .get(tenant_id)
            .map_or(self.config.capacity, |b| b.tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeDelta;
    use std::time::Duration;

    fn limiter(capacity: f64, refill: f64) -> (TenantRateLimiter, Arc<ManualClock>) {
        let start = DateTime::from_timestamp(1_735_689_600, 0).unwrap();
        let clock = Arc::new(ManualClock::with_step(start, TimeDelta::zero()));
        let limiter = TenantRateLimiter::new(
            RateLimitConfig {
                capacity,
                refill_per_second: refill,
            },
            clock.clone(),
        );
        (limiter, clock)
    }

    #[test]
    fn test_fresh_tenant_gets_full_capacity() {
        let (limiter, _) = limiter(10.0, 1.0);
        assert!(limiter.try_acquire("t1", 10));
        assert!(!limiter.try_acquire("t1", 1));
    }

    #[test]
    fn test_request_above_capacity_always_fails() {
        let (limiter, clock) = limiter(10.0, 1.0);
        assert!(!limiter.try_acquire("t1", 11));
        clock.advance(Duration::from_secs(3600));
        assert!(!limiter.try_acquire("t1", 11));
        assert_eq!(limiter.available("t1"), 10.0);
    }

    #[test]
    fn test_insufficient_tokens_do_not_partially_consume() {
        let (limiter, _) = limiter(10.0, 1.0);
        assert!(limiter.try_acquire("t1", 7));
        assert!(!limiter.try_acquire("t1", 4));
        assert!(limiter.try_acquire("t1", 3));
    }

    #[test]
    fn test_refill_after_capacity_over_rate_seconds() {
        let (limiter, clock) = limiter(10.0, 2.0);
        assert!(limiter.try_acquire("t1", 10));

        clock.advance(Duration::from_millis(2_500));
        assert!(!limiter.try_acquire("t1", 6));
        assert!(limiter.try_acquire("t1", 5));

        clock.advance(Duration::from_secs(5));
        assert!(limiter.try_acquire("t1", 10));
    }

    #[test]
    fn test_refill_is_capped() {
        let (limiter, clock) = limiter(10.0, 100.0);
        clock.advance(Duration::from_secs(60));
        assert!(limiter.try_acquire("t1", 10));
        assert!(!limiter.try_acquire("t1", 1));
    }

    #[test]
    fn test_tenants_are_isolated() {
        let (limiter, _) = limiter(5.0, 1.0);
        assert!(limiter.try_acquire("t1", 5));
        assert!(limiter.try_acquire("t2", 5));
        assert!(!limiter.try_acquire("t1", 1));
    }

    #[test]
    fn test_concurrent_acquires_never_overspend() {
        let (limiter, _) = limiter(100.0, 0.0);
        let limiter = Arc::new(limiter);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || (0..50).filter(|_| limiter.try_acquire("t1", 1)).count())
            })
            .collect();
        let granted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(granted, 100);
    }
}
