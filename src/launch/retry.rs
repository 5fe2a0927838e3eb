//! Retry Logic
//!
//! Exponential backoff with jitter for storage acquisition. Redirect creation
//! can fail transiently while other programs touch the shared path, so a
//! failed acquisition is retried a bounded number of times.
//!
//! # Example
//!
//! ```ignore
//! use isolaunch_orchestrator::launch::retry::{RetryConfig, retry_with_backoff};
//!
//! let config = RetryConfig::default()
//!     .max_attempts(3)
//!     .base_delay(Duration::from_millis(1500));
//!
//! let acquisition = retry_with_backoff(
//!     &config,
//!     |attempt| async move { acquire(attempt).await },
//!     |e: &IsolationError| e.is_retryable(),
//! )
//! .await?;
//! ```

use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Retry configuration
///
/// # Fields
///
/// * `max_attempts` - Total attempts including the first (default: 3)
/// * `base_delay` - Delay before the first retry (default: 1.5s)
/// * `max_delay` - Cap on any single delay (default: 6s)
/// * `jitter` - Random variation factor (default: 1.0)
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including initial attempt)
    pub max_attempts: usize,

    /// Base delay before first retry
    pub base_delay: Duration,

    /// Maximum delay between retries
    pub max_delay: Duration,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1500),
            max_delay: Duration::from_secs(6),
            jitter: 1.0,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of attempts (at least one)
    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the jitter factor, clamped to 0.0..=1.0
    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `attempt` (0-based)
    ///
    /// `base_delay * 2^attempt` plus up to `jitter` of that again, capped at
    /// `max_delay`.
    pub fn calculate_delay(&self, attempt: usize) -> Duration {
        let exponent = u32::try_from(attempt).unwrap_or(u32::MAX).min(16);
        let exponential_delay = self.base_delay.saturating_mul(2_u32.pow(exponent));

        let jitter_range = exponential_delay.mul_f64(self.jitter);
        let jitter_offset = rand::random::<f64>() * jitter_range.as_secs_f64();
        let jittered_delay =
            exponential_delay.saturating_add(Duration::from_secs_f64(jitter_offset));

        jittered_delay.min(self.max_delay)
    }
}

/// Retry an operation with exponential backoff
///
/// `operation` receives the 0-based attempt number. Errors for which
/// `should_retry` returns false fail immediately.
pub async fn retry_with_backoff<F, Fut, T, E, P>(
    config: &RetryConfig,
    mut operation: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match operation(attempt).await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!("Operation succeeded on attempt {}", attempt + 1);
                }
                return Ok(result);
            }
            Err(e) if attempt + 1 < max_attempts && should_retry(&e) => {
                let delay = config.calculate_delay(attempt);
                tracing::warn!(
                    "Attempt {}/{} failed: {}, retrying in {:?}",
                    attempt + 1,
                    max_attempts,
                    e,
                    delay
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                tracing::error!("Operation failed after {} attempts: {}", attempt + 1, e);
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.base_delay, Duration::from_millis(1500));
        assert_eq!(config.max_delay, Duration::from_secs(6));
        assert_eq!(config.jitter, 1.0);
    }

    #[test]
    fn test_retry_config_builder() {
        let config = RetryConfig::new()
            .max_attempts(0)
            .base_delay(Duration::from_millis(50))
            .max_delay(Duration::from_secs(10))
            .jitter(1.5);

        assert_eq!(config.max_attempts, 1);
        assert_eq!(config.base_delay, Duration::from_millis(50));
        assert_eq!(config.max_delay, Duration::from_secs(10));
        assert_eq!(config.jitter, 1.0);
    }

    #[test]
    fn test_calculate_delay_exponential_without_jitter() {
        let config = RetryConfig::new()
            .base_delay(Duration::from_millis(100))
            .max_delay(Duration::from_secs(1))
            .jitter(0.0);

        assert_eq!(config.calculate_delay(0), Duration::from_millis(100));
        assert_eq!(config.calculate_delay(1), Duration::from_millis(200));
        assert_eq!(config.calculate_delay(2), Duration::from_millis(400));
        assert_eq!(config.calculate_delay(10), Duration::from_secs(1));
        assert_eq!(config.calculate_delay(usize::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_calculate_delay_jitter_bounds() {
        let config = RetryConfig::new()
            .base_delay(Duration::from_millis(100))
            .max_delay(Duration::from_secs(10))
            .jitter(0.5);

        for _ in 0..50 {
            let delay = config.calculate_delay(1);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(300));
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_failure() {
        let config = RetryConfig::new()
            .base_delay(Duration::from_millis(5))
            .jitter(0.0);
        let calls = Arc::new(AtomicUsize::new(0));

        let result: Result<i32, String> = retry_with_backoff(
            &config,
            |attempt| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if attempt < 1 {
                        Err("busy".to_string())
                    } else {
                        Ok(42)
                    }
                }
            },
            |_| true,
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_stops_at_max_attempts() {
        let config = RetryConfig::new()
            .max_attempts(3)
            .base_delay(Duration::from_millis(5))
            .jitter(0.0);
        let calls = Arc::new(AtomicUsize::new(0));

        let result: Result<(), String> = retry_with_backoff(
            &config,
            |_| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("still busy".to_string())
                }
            },
            |_| true,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let config = RetryConfig::new().base_delay(Duration::from_millis(5));
        let calls = Arc::new(AtomicUsize::new(0));

        let result: Result<(), String> = retry_with_backoff(
            &config,
            |_| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("conflict".to_string())
                }
            },
            |e: &String| e != "conflict",
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
