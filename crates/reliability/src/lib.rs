//! Reliability primitives shared by the LLM router and tool dispatch:
//! circuit breakers, token-bucket rate limiting, retry with jittered
//! backoff, and token/cost budget tracking.

mod breaker;
mod budget;
mod rate_limit;
mod retry;

pub use breaker::{BreakerConfig, BreakerRegistry, BreakerState, CircuitBreaker};
pub use budget::{TokenTracker, UsageRecord, UsageTotals};
pub use rate_limit::{RateLimiter, RateLimits};
pub use retry::{is_retryable, retry, RetryPolicy};
