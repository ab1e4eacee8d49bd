use crate::config::RetryConfig;
use crate::types::{DispatchError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

/// Run `operation` until it succeeds, the error is not retryable, or
/// `config.max_attempts` attempts have failed.
///
/// Every attempt is bounded by `attempt_timeout`; an attempt that runs out of
/// time fails with [`DispatchError::ProviderTimeout`]. Both attempts and
/// backoff sleeps race against `cancel`. The closure receives the 1-indexed
/// attempt number. On exhaustion the last attempt's error is returned.
pub async fn retry_with_backoff<F, Fut, T>(
    target: &str,
    config: &RetryConfig,
    attempt_timeout: Duration,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
            outcome = timeout(attempt_timeout, operation(attempt)) => outcome,
        };

        let error = match outcome {
            Ok(Ok(result)) => return Ok(result),
            Ok(Err(e)) => e,
            Err(_) => DispatchError::ProviderTimeout {
                provider: target.to_string(),
                timeout_ms: attempt_timeout.as_millis() as u64,
            },
        };

        if !error.is_retryable() {
            tracing::debug!(
                target_provider = target,
                error = %error,
                "Error is not retryable"
            );
            return Err(error);
        }

        if attempt >= config.max_attempts {
            tracing::warn!(
                target_provider = target,
                attempts = attempt,
                max_attempts = config.max_attempts,
                error = %error,
                "Max retry attempts exceeded"
            );
            return Err(error);
        }

        let delay = calculate_backoff(attempt, config);
        tracing::info!(
            target_provider = target,
            attempt = attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Retrying request after error"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
            _ = sleep(delay) => {}
        }
    }
}

/// Delay after the `failures`-th failed attempt, i.e. before attempt
/// `failures + 1`: `min(backoff_ms * 2^(failures - 1), max_backoff_ms)`.
pub fn calculate_backoff(failures: usize, config: &RetryConfig) -> Duration {
    let exponent = failures.saturating_sub(1).min(u32::MAX as usize) as u32;
    let base_delay = config
        .backoff_ms
        .saturating_mul(2_u64.saturating_pow(exponent));
    let delay = base_delay.min(config.max_backoff_ms);

    if !config.jitter {
        return Duration::from_millis(delay);
    }

    // Add jitter (±25%), never past the cap
    let jitter = (delay as f64) * 0.25;
    let jitter_range = rand::random::<f64>() * jitter * 2.0 - jitter;
    let final_delay = ((delay as f64 + jitter_range).max(0.0) as u64).min(config.max_backoff_ms);

    Duration::from_millis(final_delay)
}
