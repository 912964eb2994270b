//! Jittered exponential-backoff retry.

use std::future::Future;
use std::time::Duration;

use aegis_domain::{Error, Result};
use rand::Rng;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Jitter fraction applied to each delay (0.2 = ±20%).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), jittered.
    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .as_millis()
            .saturating_mul(1u128 << (attempt - 1).min(20)) as u64;
        let capped = exp.min(self.max_delay.as_millis() as u64);
        let jitter_span = (capped as f64 * self.jitter) as i64;
        let offset = if jitter_span > 0 {
            rand::thread_rng().gen_range(-jitter_span..=jitter_span)
        } else {
            0
        };
        Duration::from_millis(capped.saturating_add_signed(offset))
    }
}

/// Whether an error is worth retrying: timeouts, transport failures, and
/// 5xx-class provider errors. Permanent provider errors (auth, unknown
/// model) and everything else fail fast.
pub fn is_retryable(err: &Error) -> bool {
    match err {
        Error::Timeout(_) | Error::Http(_) | Error::RateLimited(_) => true,
        Error::Provider { message, .. } => {
            message.contains("HTTP 5") || message.contains("HTTP 429") || message.contains("HTTP 529")
        }
        _ => false,
    }
}

/// Run `op` with up to `policy.max_retries` retries for errors accepted
/// by `classify`. Each retry increments the `aegis_llm_retries_total`
/// metric. Returns the final error when retries are exhausted.
pub async fn retry<T, F, Fut>(
    policy: RetryPolicy,
    classify: impl Fn(&Error) -> bool,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < policy.max_retries && classify(&err) => {
                attempt += 1;
                metrics::counter!("aegis_llm_retries_total", 1);
                let delay = policy.delay_for(attempt);
                tracing::debug!(attempt, ?delay, error = %err, "retrying after error");
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
