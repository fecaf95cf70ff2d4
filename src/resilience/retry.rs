// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry policies.
//!
//! [`retry`] drives an operation in place (used to establish store
//! connections). The batch processor uses the same [`RetryConfig`] to compute
//! requeue delays for failed writes via [`RetryConfig::delay_for_attempt`].
//!
//! # Example
//!
//! ```
//! use timecard_engine::resilience::retry::{Backoff, RetryConfig};
//! use std::time::Duration;
//!
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_retries, Some(5));
//!
//! // Write-behind requeue: linear in the attempt count, capped
//! let writes = RetryConfig::write_behind(Duration::from_secs(1), Duration::from_secs(60), 3);
//! assert_eq!(writes.backoff, Backoff::Linear);
//! assert_eq!(writes.delay_for_attempt(2), Duration::from_secs(2));
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// `initial_delay * factor^(attempt - 1)`
    Exponential { factor: f64 },
    /// `initial_delay * attempt`
    Linear,
}

/// Configuration for connection/operation retry behavior.
///
/// Use the preset constructors for common patterns:
/// - [`RetryConfig::startup()`] - Fast-fail for initial connections
/// - [`RetryConfig::daemon()`] - Infinite retry for runtime reconnection
/// - [`RetryConfig::query()`] - Quick retry for individual operations
/// - [`RetryConfig::write_behind()`] - Requeue schedule for failed batch writes
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff: Backoff,
    /// Attempts before giving up; `None` retries forever
    pub max_retries: Option<usize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::daemon()
    }
}

impl RetryConfig {
    /// Fast-fail retry for initial startup connection.
    /// 5 attempts with exponential backoff, failing after ~5 seconds.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            backoff: Backoff::Exponential { factor: 2.0 },
        }
    }

    /// Infinite retry for long-running processes, capped at 5 minutes between attempts.
    #[must_use]
    pub fn daemon() -> Self {
        Self {
            max_retries: None,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff: Backoff::Exponential { factor: 2.0 },
        }
    }

    /// Quick retry for individual queries (don't block forever).
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            backoff: Backoff::Exponential { factor: 2.0 },
        }
    }

    /// Delay proportional to the attempt count, capped at `max_delay`.
    #[must_use]
    pub fn write_behind(step: Duration, max_delay: Duration, max_retries: usize) -> Self {
        Self {
            max_retries: Some(max_retries),
            initial_delay: step,
            max_delay,
            backoff: Backoff::Linear,
        }
    }

    /// Fast retry for tests (minimal delays)
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff: Backoff::Exponential { factor: 2.0 },
        }
    }

    /// Delay to wait after the `attempt`-th failure (1-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let delay = match self.backoff {
            Backoff::Linear => self.initial_delay.saturating_mul(attempt),
            Backoff::Exponential { factor } => {
                let exp = factor.powi(attempt.saturating_sub(1).min(64) as i32);
                Duration::try_from_secs_f64(self.initial_delay.as_secs_f64() * exp)
                    .unwrap_or(self.max_delay)
            }
        };
        delay.min(self.max_delay)
    }

    /// True when `attempts` failures have used up the retry budget.
    #[must_use]
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        self.max_retries.is_some_and(|max| attempts as usize >= max)
    }
}

pub async fn retry<F, Fut, T, E>(operation_name: &str, config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempts: u32 = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!("Operation '{}' succeeded after {} retries", operation_name, attempts);
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;
                if config.is_exhausted(attempts) {
                    return Err(err);
                }

                let delay = config.delay_for_attempt(attempts);
                match config.max_retries {
                    Some(max) => warn!(
                        "Operation '{}' failed (attempt {}/{}): {}. Retrying in {:?}...",
                        operation_name, attempts, max, err, delay
                    ),
                    None => warn!(
                        "Operation '{}' failed (attempt {}, will retry forever): {}. Next retry in {:?}...",
                        operation_name, attempts, err, delay
                    ),
                }

                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct TestError(String);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_first_try() {
        let result: Result<i32, TestError> = retry("test_op", &RetryConfig::test(), || async { Ok(42) }).await;

        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<i32, TestError> = retry("test_op", &RetryConfig::test(), || {
            let a = attempts_clone.clone();
            async move {
                let count = a.fetch_add(1, Ordering::SeqCst) + 1;
                if count < 3 {
                    Err(TestError(format!("fail {}", count)))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausts_retries() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<i32, TestError> = retry("test_op", &RetryConfig::test(), || {
            let a = attempts_clone.clone();
            async move {
                a.fetch_add(1, Ordering::SeqCst);
                Err(TestError("always fail".to_string()))
            }
        })
        .await;

        assert!(result.unwrap_err().0.contains("always fail"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_retry_config_presets() {
        assert_eq!(RetryConfig::startup().max_retries, Some(5));
        assert!(RetryConfig::daemon().max_retries.is_none());
        assert_eq!(RetryConfig::query().max_retries, Some(3));
    }

    #[test]
    fn test_exponential_delays() {
        let config = RetryConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff: Backoff::Exponential { factor: 2.0 },
            max_retries: Some(5),
        };

        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(config.delay_for_attempt(40), Duration::from_secs(10));
    }

    #[test]
    fn test_linear_delays_cap_at_max() {
        let config = RetryConfig::write_behind(Duration::from_secs(1), Duration::from_secs(5), 10);

        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(3));
        assert_eq!(config.delay_for_attempt(9), Duration::from_secs(5));
    }

    #[test]
    fn test_exhaustion() {
        let config = RetryConfig::write_behind(Duration::from_secs(1), Duration::from_secs(5), 3);
        assert!(!config.is_exhausted(2));
        assert!(config.is_exhausted(3));
        assert!(!RetryConfig::daemon().is_exhausted(1_000));
    }
}
