//! Retry logic with exponential backoff
//!
//! Two flavours share one delay schedule:
//! - [`with_retry`] drives an async operation in a loop (metadata pages, link refetches)
//! - [`backoff_delay`] hands the delay for retry `n` to a scheduler that re-queues work
//!   itself instead of sleeping inline (chunk downloads)

use crate::config::RetryConfig;
use crate::error::Error;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (timeouts, throttling, connection resets) should return `true`.
/// Permanent failures (bad metadata, terminal HTTP status, cancellation) should return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::TransientNetwork(_) => true,
            // Metadata calls report their own transport trouble this way
            Error::MetadataFetch(msg) => {
                msg.contains("timeout")
                    || msg.contains("temporar")
                    || msg.contains("unavailable")
                    || msg.contains("connection")
            }
            // Expired links are refreshed, not retried
            Error::ExpiredLink(_) => false,
            // Integrity failures get exactly one extra attempt, decided by the manager
            Error::DataIntegrity(_) => false,
            Error::Http { status, .. } => *status == 408 || *status == 429 || *status >= 500,
            Error::Config { .. }
            | Error::InvalidMetadata(_)
            | Error::ChunkFailed { .. }
            | Error::Decode { .. }
            | Error::Cancelled
            | Error::Other(_) => false,
        }
    }
}

/// Execute an async operation with exponential backoff retry logic
///
/// Returns the successful result or the last error once `config.max_attempts` retries
/// have been spent (or immediately for a non-retryable error).
pub async fn with_retry<F, Fut, T, E>(config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(attempts = attempt + 1, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if e.is_retryable() && attempt < config.max_attempts => {
                attempt += 1;
                let delay = backoff_delay(config, attempt);

                tracing::warn!(
                    error = %e,
                    attempt = attempt,
                    max_attempts = config.max_attempts,
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                if e.is_retryable() {
                    tracing::error!(
                        error = %e,
                        attempts = attempt + 1,
                        "Operation failed after all retry attempts exhausted"
                    );
                } else {
                    tracing::error!(error = %e, "Operation failed with non-retryable error");
                }
                return Err(e);
            }
        }
    }
}

/// Delay to wait before retry number `retry` (1-based)
///
/// `initial_delay * multiplier^(retry - 1)`, capped at `max_delay`, then jittered if enabled.
pub fn backoff_delay(config: &RetryConfig, retry: u32) -> Duration {
    let exponent = retry.saturating_sub(1).min(32) as i32;
    let scaled = config.initial_delay.as_secs_f64() * config.backoff_multiplier.powi(exponent);
    let capped = if scaled.is_finite() {
        Duration::from_secs_f64(scaled).min(config.max_delay)
    } else {
        config.max_delay
    };

    if config.jitter {
        add_jitter(capped)
    } else {
        capped
    }
}

/// Add random jitter to a delay to prevent thundering herd
///
/// Jitter is uniformly distributed between 0% and 100% of the delay, so the result lies
/// between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_factor))
}
