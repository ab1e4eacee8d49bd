//! Resilience primitives guarding every provider call.
//!
//! ```text
//! caller -> rate_limiter (admission per caller key)
//!        -> circuit_breaker (per provider, fail fast while open)
//!        -> retry (bounded exponential backoff, per-attempt timeout)
//! ```

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod retry;

pub use circuit_breaker::{
    BreakerSnapshot, CallPermit, CircuitBreaker, CircuitState, HealthLevel,
};
pub use rate_limiter::{RateLimitDecision, RateLimiter, RateLimiterStats};
pub use retry::{calculate_backoff, retry_with_backoff};
