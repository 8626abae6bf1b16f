//! Retry utilities with exponential backoff and jitter.
//!
//! `RetryConfig::delay_for` is the single backoff curve used both by
//! `retry_with_backoff` (startup calls into the kernel) and by the work
//! queue's per-key rate limiter.
//!
//! # Example
//!
//! ```ignore
//! use route_forge_common::retry::{retry_with_backoff, RetryConfig};
//!
//! retry_with_backoff(&RetryConfig::with_max_attempts(5), "sync_rules", || async {
//!     manager.sync_rules().await
//! })
//! .await?;
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Backoff configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Per-key requeue curve: 5ms doubling up to 1000s, never giving up
    pub fn per_item() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
            backoff_multiplier: 2.0,
        }
    }

    /// Delay before retry number `failures` (0-based), without jitter
    pub fn delay_for(&self, failures: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(failures.min(i32::MAX as u32) as i32);
        let secs = self.initial_delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Retries until success or until `max_attempts` is exhausted, in which case
/// the last error is returned.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                attempt += 1;
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                // 0.5x to 1.5x of the nominal delay
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let delay = config.delay_for(attempt - 1);
                let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = jittered_delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(jittered_delay).await;
            }
        }
    }
}
