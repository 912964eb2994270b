//! Per-key token-bucket rate limiting over two dimensions: requests per
//! minute and tokens per minute.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy)]
pub struct RateLimits {
    pub requests_per_minute: u32,
    pub tokens_per_minute: u32,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            tokens_per_minute: 100_000,
        }
    }
}

struct Bucket {
    limits: RateLimits,
    requests: f64,
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(limits: RateLimits) -> Self {
        Self {
            limits,
            requests: limits.requests_per_minute as f64,
            tokens: limits.tokens_per_minute as f64,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let elapsed = self.last_refill.elapsed().as_secs_f64();
        self.last_refill = Instant::now();
        self.requests = (self.requests + elapsed * self.limits.requests_per_minute as f64 / 60.0)
            .min(self.limits.requests_per_minute as f64);
        self.tokens = (self.tokens + elapsed * self.limits.tokens_per_minute as f64 / 60.0)
            .min(self.limits.tokens_per_minute as f64);
    }
}

/// Token-bucket limiter keyed by provider id.
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Register (or replace) the limits for a key.
    pub fn configure(&self, key: &str, limits: RateLimits) {
        self.buckets
            .lock()
            .insert(key.to_string(), Bucket::new(limits));
    }

    /// Try to take one request slot plus `estimated_tokens` from the
    /// bucket. Returns `false` without consuming anything when either
    /// dimension lacks capacity. Unknown keys are unlimited.
    pub fn acquire(&self, key: &str, estimated_tokens: u32) -> bool {
        let mut buckets = self.buckets.lock();
        let Some(bucket) = buckets.get_mut(key) else {
            return true;
        };
        bucket.refill();
        if bucket.requests < 1.0 || bucket.tokens < estimated_tokens as f64 {
            return false;
        }
        bucket.requests -= 1.0;
        bucket.tokens -= estimated_tokens as f64;
        true
    }

    /// Settle an estimate against actual usage: refunds over-estimates,
    /// deducts under-estimates (clamped to the bucket range).
    pub fn report_usage(&self, key: &str, estimated_tokens: u32, actual_tokens: u32) {
        let mut buckets = self.buckets.lock();
        let Some(bucket) = buckets.get_mut(key) else {
            return;
        };
        let delta = estimated_tokens as f64 - actual_tokens as f64;
        bucket.tokens = (bucket.tokens + delta)
            .clamp(0.0, bucket.limits.tokens_per_minute as f64);
    }

    /// Remaining (requests, tokens) capacity for a key, after refill.
    pub fn remaining(&self, key: &str) -> Option<(f64, f64)> {
        let mut buckets = self.buckets.lock();
        let bucket = buckets.get_mut(key)?;
        bucket.refill();
        Some((bucket.requests, bucket.tokens))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_consumes_both_dimensions() {
        let limiter = RateLimiter::new();
        limiter.configure(
            "p",
            RateLimits {
                requests_per_minute: 2,
                tokens_per_minute: 1_000,
            },
        );

        assert!(limiter.acquire("p", 400));
        assert!(limiter.acquire("p", 400));
        // Out of request slots even though tokens remain.
        assert!(!limiter.acquire("p", 1));
    }

    #[test]
    fn token_dimension_limits() {
        let limiter = RateLimiter::new();
        limiter.configure(
            "p",
            RateLimits {
                requests_per_minute: 100,
                tokens_per_minute: 500,
            },
        );
        assert!(limiter.acquire("p", 400));
        assert!(!limiter.acquire("p", 400));
        // A failed acquire consumes nothing.
        assert!(limiter.acquire("p", 100));
    }

    #[test]
    fn report_usage_refunds_overestimate() {
        let limiter = RateLimiter::new();
        limiter.configure(
            "p",
            RateLimits {
                requests_per_minute: 100,
                tokens_per_minute: 1_000,
            },
        );
        assert!(limiter.acquire("p", 900));
        assert!(!limiter.acquire("p", 900));

        // Actual usage was far lower; the refund restores capacity.
        limiter.report_usage("p", 900, 100);
        assert!(limiter.acquire("p", 700));
    }

    #[test]
    fn unknown_key_is_unlimited() {
        let limiter = RateLimiter::new();
        assert!(limiter.acquire("nobody", 1_000_000));
    }
}
