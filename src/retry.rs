use crate::config::RetryConfig;
use crate::error::{EngineError, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Bounded retries with exponential backoff and jitter around a fallible async operation.
///
/// Errors whose [`kind`](EngineError::kind) is permanent end the loop at once; cancellation is
/// observed before every attempt and during every backoff sleep.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// `min(maxDelay, initialDelay * backoffMultiplier^(attempt-1))`, before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_ms =
            self.config.initial_delay_ms as f64 * self.config.backoff_multiplier.powi(exponent);
        let capped_ms = delay_ms.min(self.config.max_delay_ms as f64);
        if capped_ms.is_finite() && capped_ms > 0.0 {
            Duration::from_millis(capped_ms.round() as u64)
        } else {
            Duration::ZERO
        }
    }

    /// The base delay perturbed uniformly by `±jitterFraction`, never negative.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt).as_secs_f64();
        let spread = base * self.config.jitter_fraction;
        let offset = if spread > 0.0 {
            rand::thread_rng().gen_range(-spread..=spread)
        } else {
            0.0
        };
        Duration::from_secs_f64((base + offset).max(0.0))
    }

    /// Runs `op` until it succeeds, fails permanently, runs out of attempts, or `cancel` fires.
    /// `op` receives the 1-based attempt number.
    pub async fn execute<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        operation: &str,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled.context(format!(
                    "{} before attempt {}",
                    operation, attempt
                )));
            }

            let error = match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("{} succeeded on attempt {}", operation, attempt);
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            if error.is_permanent() {
                debug!("{} failed permanently on attempt {}: {}", operation, attempt, error);
                return Err(error.context(format!(
                    "{} failed on attempt {} (not retryable)",
                    operation, attempt
                )));
            }

            if attempt >= max_attempts {
                return Err(EngineError::RetriesExhausted {
                    operation: operation.to_string(),
                    attempts: attempt,
                    source: Box::new(error),
                });
            }

            let delay = self.backoff(attempt);
            warn!(
                "{} failed on attempt {}/{}: {}; retrying in {:?}",
                operation, attempt, max_attempts, error, delay
            );
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(EngineError::Cancelled.context(format!(
                        "{} while waiting to retry after attempt {}",
                        operation, attempt
                    )));
                }
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}
