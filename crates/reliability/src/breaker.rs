//! Circuit breaker with a named registry.
//!
//! States: CLOSED → (N consecutive failures) → OPEN → (after the reset
//! timeout) → HALF_OPEN → (first success → CLOSED | first failure →
//! OPEN). While OPEN, calls are rejected with a typed error carrying
//! `opened_at` and `reset_at`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use aegis_domain::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config & state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive failures before opening.
    pub failure_threshold: u32,
    /// How long the breaker stays open before probing.
    pub reset_timeout: Duration,
    /// Wall-clock timeout applied to every call.
    pub op_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            op_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_instant: Option<Instant>,
    opened_at: Option<DateTime<Utc>>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// CircuitBreaker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_instant: None,
                opened_at: None,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Run `op` through the breaker with the configured timeout.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.check_gate()?;

        let result = match tokio::time::timeout(self.config.op_timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "'{}' timed out after {:?}",
                self.name, self.config.op_timeout
            ))),
        };

        match &result {
            Ok(_) => self.on_success(),
            Err(_) => self.on_failure(),
        }
        result
    }

    /// Reject while open; flip to half-open once the reset timeout has
    /// elapsed (the caller's request becomes the probe).
    fn check_gate(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != BreakerState::Open {
            return Ok(());
        }

        let elapsed = inner
            .opened_instant
            .map(|t| t.elapsed())
            .unwrap_or(Duration::ZERO);
        if elapsed >= self.config.reset_timeout {
            inner.state = BreakerState::HalfOpen;
            tracing::debug!(breaker = %self.name, "circuit half-open");
            return Ok(());
        }

        let opened_at = inner.opened_at.unwrap_or_else(Utc::now);
        let reset_at = opened_at
            + chrono::Duration::from_std(self.config.reset_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(30));
        Err(Error::CircuitOpen {
            name: self.name.clone(),
            opened_at,
            reset_at,
        })
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state == BreakerState::HalfOpen {
            tracing::info!(breaker = %self.name, "circuit closed after successful probe");
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_instant = None;
        inner.opened_at = None;
    }

    fn on_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::HalfOpen => Self::open(&self.name, &mut inner),
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    Self::open(&self.name, &mut inner);
                }
            }
            BreakerState::Open => {}
        }
    }

    fn open(name: &str, inner: &mut Inner) {
        inner.state = BreakerState::Open;
        inner.opened_instant = Some(Instant::now());
        inner.opened_at = Some(Utc::now());
        tracing::warn!(breaker = %name, failures = inner.consecutive_failures, "circuit opened");
    }

    /// Force back to closed (test seam, used by the registry).
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_instant = None;
        inner.opened_at = None;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Named breakers, created on first use with a shared default config.
pub struct BreakerRegistry {
    default_config: BreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(default_config: BreakerConfig) -> Self {
        Self {
            default_config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.default_config)))
            .clone()
    }

    /// Reset every breaker to closed (test seam).
    pub fn reset_all(&self) {
        for breaker in self.breakers.lock().values() {
            breaker.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            reset_timeout: Duration::from_millis(50),
            op_timeout: Duration::from_millis(200),
        }
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<()> {
        breaker
            .call(|| async { Err::<(), _>(Error::Http("boom".into())) })
            .await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<()> {
        breaker.call(|| async { Ok(()) }).await
    }

    #[tokio::test]
    async fn opens_after_threshold() {
        let breaker = CircuitBreaker::new("test", fast_config());
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        // While open, calls are rejected with the typed error.
        let err = succeed(&breaker).await.unwrap_err();
        match err {
            Error::CircuitOpen {
                name,
                opened_at,
                reset_at,
            } => {
                assert_eq!(name, "test");
                assert!(reset_at > opened_at);
            }
            other => panic!("expected CircuitOpen, got {other}"),
        }
    }

    #[tokio::test]
    async fn half_open_success_closes() {
        let breaker = CircuitBreaker::new("test", fast_config());
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        // First call after reset_timeout runs as the half-open probe.
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("test", fast_config());
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let breaker = CircuitBreaker::new("test", fast_config());
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        succeed(&breaker).await.unwrap();
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        // Only 2 consecutive failures since the success.
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn op_timeout_counts_as_failure() {
        let breaker = CircuitBreaker::new("slow", fast_config());
        let err = breaker
            .call(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn registry_shares_and_resets() {
        let registry = BreakerRegistry::new(fast_config());
        let a = registry.get("provider-a");
        let b = registry.get("provider-a");
        assert!(Arc::ptr_eq(&a, &b));

        for _ in 0..3 {
            let _ = fail(&a).await;
        }
        assert_eq!(b.state(), BreakerState::Open);

        registry.reset_all();
        assert_eq!(a.state(), BreakerState::Closed);
    }
}
