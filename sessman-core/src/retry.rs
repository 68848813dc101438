//! Bounded retry with exponential backoff

use futures::future::BoxFuture;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, warn};

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    pub max_attempts: usize,
    /// Initial delay between retries in milliseconds
    pub initial_delay_ms: u64,
    /// Maximum delay between retries in milliseconds
    pub max_delay_ms: u64,
    /// Backoff multiplier (exponential backoff)
    pub backoff_multiplier: f64,
    /// Whether to add +/-10% jitter to delays
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 5000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Backoff delay before retry number `retry` (1-based), without jitter
    pub fn base_delay_ms(&self, retry: usize) -> u64 {
        let mut delay = self.initial_delay_ms as f64;
        for _ in 1..retry {
            delay *= self.backoff_multiplier;
            if delay >= self.max_delay_ms as f64 {
                break;
            }
        }
        (delay as u64).min(self.max_delay_ms)
    }

    fn delay_ms(&self, retry: usize) -> u64 {
        let delay = self.base_delay_ms(retry);
        if self.jitter {
            let jitter = (fastrand::f64() - 0.5) * 2.0 * 0.1;
            ((delay as f64) * (1.0 + jitter)) as u64
        } else {
            delay
        }
    }
}

/// Retry an async operation with exponential backoff
///
/// Returns the last error once `max_attempts` is exhausted.
pub async fn retry_async<'a, F, T, E>(
    mut operation: F,
    config: &RetryConfig,
    operation_name: &str,
) -> Result<T, E>
where
    F: FnMut() -> BoxFuture<'a, Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        debug!(
            operation = operation_name,
            attempt = attempt,
            max_attempts = max_attempts,
            "Attempting operation"
        );

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(
                        operation = operation_name,
                        attempt = attempt,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(error) => {
                if attempt >= max_attempts {
                    error!(
                        operation = operation_name,
                        attempt = attempt,
                        error = %error,
                        "Operation failed after all retry attempts"
                    );
                    return Err(error);
                }

                let delay = config.delay_ms(attempt);
                warn!(
                    operation = operation_name,
                    attempt = attempt,
                    error = %error,
                    delay_ms = delay,
                    "Operation failed, retrying"
                );

                sleep(Duration::from_millis(delay)).await;
            }
        }
    }
}
