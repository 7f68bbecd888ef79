//! Per-attempt retry with exponential backoff and jitter
//!
//! This is the fine-grained retry layer: it re-runs a single operation while
//! its errors classify as transient. The queue applies its own coarse per-job
//! retry (requeue with boosted priority) above this layer.

use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::{
    config::RetryConfig,
    core::error::{DispatchError, DispatchResult},
};

/// Computes exponential backoff with optional jitter.
#[derive(Debug, Clone)]
pub struct BackoffCalculator;

impl BackoffCalculator {
    /// Calculate backoff delay for a given attempt index (0-based).
    ///
    /// `delay = min(base * multiplier^attempt, max)` scaled by a uniform
    /// jitter in `[-jitter_factor, +jitter_factor]`, clamped at zero.
    pub fn calculate_delay(config: &RetryConfig, attempt: u32) -> Duration {
        let pow = config.backoff_multiplier.powi(attempt as i32);
        let delay_ms = ((config.initial_backoff_ms as f32 * pow) as u64).min(config.max_backoff_ms);

        let jitter = config.jitter_factor.clamp(0.0, 1.0);
        if jitter > 0.0 {
            let mut rng = rand::rng();
            let jitter_scale: f32 = rng.random_range(-jitter..=jitter);
            let jitter_ms = (delay_ms as f32 * jitter_scale)
                .round()
                .max(-(delay_ms as f32));
            let adjusted = (delay_ms as i64 + jitter_ms as i64).max(0) as u64;
            return Duration::from_millis(adjusted);
        }

        Duration::from_millis(delay_ms)
    }
}

/// Async retry executor for fallible dispatch operations.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor;

impl RetryExecutor {
    /// Execute `operation` with retries and backoff.
    ///
    /// - `operation(attempt)`: perform one attempt (0-based).
    /// - Errors are retried only while `DispatchError::is_retryable()` holds
    ///   and attempts remain; anything else propagates immediately, before
    ///   any backoff sleep is scheduled.
    /// - `on_retry(next_attempt, error, delay)` is called before each backoff
    ///   sleep, for observability only.
    pub async fn run<Op, Fut, T, OnRetry>(
        config: &RetryConfig,
        mut operation: Op,
        on_retry: OnRetry,
    ) -> DispatchResult<T>
    where
        Op: FnMut(u32) -> Fut,
        Fut: Future<Output = DispatchResult<T>>,
        OnRetry: Fn(u32, &DispatchError, Duration),
    {
        let max = config.max_attempts.max(1);
        let mut attempt: u32 = 0;

        loop {
            match operation(attempt).await {
                Ok(output) => return Ok(output),
                Err(error) => {
                    let is_last = attempt + 1 >= max;
                    if !error.is_retryable() || is_last {
                        return Err(error);
                    }

                    let next_attempt = attempt + 1;
                    let delay = BackoffCalculator::calculate_delay(config, attempt);
                    debug!(
                        attempt,
                        next_attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Retry backoff"
                    );
                    on_retry(next_attempt, &error, delay);
                    tokio::time::sleep(delay).await;

                    attempt = next_attempt;
                }
            }
        }
    }
}
