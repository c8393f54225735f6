//! Retry and timeout utilities.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Retry configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts (1 = no retries).
    pub max_attempts: u32,
    /// Initial delay between retries, in milliseconds.
    pub initial_delay_ms: u64,
    /// Maximum delay between retries, in milliseconds.
    pub max_delay_ms: u64,
    /// Backoff multiplier (e.g., 2.0 for exponential).
    pub backoff_multiplier: f64,
    /// Add jitter to delays.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Create a config for no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Calculate delay for a given attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let initial = Duration::from_millis(self.initial_delay_ms).as_secs_f64();
        let max = Duration::from_millis(self.max_delay_ms).as_secs_f64();
        let base_delay = initial * self.backoff_multiplier.powi((attempt - 2) as i32);

        // NaN and negative products collapse into [0, max]
        let delay = Duration::from_secs_f64(base_delay.min(max).max(0.0));

        if self.jitter {
            // Up to 25% extra
            let factor: f64 = rand::thread_rng().gen_range(0.0..0.25);
            delay + Duration::from_secs_f64(delay.as_secs_f64() * factor)
        } else {
            delay
        }
    }
}

/// Retry a fallible async operation with exponential backoff.
pub async fn retry_with_backoff<T, E, F, Fut>(
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "Operation succeeded after retries");
                }
                return Ok(value);
            }
            Err(e) if attempt < max_attempts => {
                warn!(attempt, max_attempts, error = %e, "Operation failed, retrying");
                attempt += 1;
                let delay = config.delay_for_attempt(attempt);
                debug!(attempt, ?delay, "Retrying after delay");
                sleep(delay).await;
            }
            Err(e) => {
                warn!(attempt, max_attempts, error = %e, "Operation failed");
                return Err(e);
            }
        }
    }
}

/// Run an operation with a timeout.
pub async fn with_timeout<T, F, Fut>(
    timeout: Duration,
    operation: F,
) -> Result<T, crate::TypeFillError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, operation())
        .await
        .map_err(|_| crate::TypeFillError::Timeout(timeout))
}
