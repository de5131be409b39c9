//! Retry logic with exponential backoff for transfer operations.
//!
//! Only transient errors ([`TransferError::is_retryable`]) are retried;
//! configuration and permission errors fail on the first attempt.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::TransferError;

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first try (default: 3).
    pub max_retries: u32,
    /// Initial backoff duration (default: 100ms).
    pub initial_backoff: Duration,
    /// Maximum backoff duration (default: 10 seconds).
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff (default: 2.0).
    pub backoff_multiplier: f64,
    /// Whether to add random jitter to backoff (default: true).
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Fail on the first error.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }
}

/// Outcome of a retry operation.
#[derive(Debug)]
pub enum RetryOutcome<T> {
    /// Operation succeeded after `attempts` tries.
    Success {
        /// The value returned by the operation.
        value: T,
        /// Total number of attempts made.
        attempts: u32,
    },
    /// All retries exhausted, or a permanent error occurred.
    Exhausted {
        /// The last error that occurred.
        last_error: TransferError,
        /// Total number of attempts made.
        attempts: u32,
    },
}

impl<T> RetryOutcome<T> {
    /// Convert into a plain result, dropping the attempt count.
    pub fn into_result(self) -> Result<T, TransferError> {
        match self {
            RetryOutcome::Success { value, .. } => Ok(value),
            RetryOutcome::Exhausted { last_error, .. } => Err(last_error),
        }
    }
}

/// Executor for retry operations.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    /// Create a new RetryExecutor with the given configuration.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// The active configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Execute an operation with retry logic.
    ///
    /// `operation` is called again for each attempt, so it must be safe to
    /// repeat (all [`crate::TransferManager`] operations are).
    pub async fn execute<F, Fut, T>(&self, operation: F) -> RetryOutcome<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, TransferError>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => {
                    return RetryOutcome::Success {
                        value,
                        attempts: attempt,
                    }
                }
                Err(e) => {
                    if !e.is_retryable() || attempt > self.config.max_retries {
                        return RetryOutcome::Exhausted {
                            last_error: e,
                            attempts: attempt,
                        };
                    }
                    let backoff = self.compute_backoff(attempt - 1);
                    warn!(
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Transfer failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    /// Computes `initial_backoff * backoff_multiplier^attempt`, capped at
    /// `max_backoff`, plus up to 50% jitter when enabled.
    fn compute_backoff(&self, attempt: u32) -> Duration {
        let base_delay_ms = self.config.initial_backoff.as_millis() as f64;
        let max_delay_ms = self.config.max_backoff.as_millis() as f64;

        let computed = base_delay_ms * self.config.backoff_multiplier.powi(attempt as i32);
        let capped = computed.min(max_delay_ms) as u64;

        if self.config.jitter && capped >= 2 {
            let jitter_ms = rand::thread_rng().gen_range(0..capped / 2);
            Duration::from_millis(capped.saturating_add(jitter_ms))
        } else {
            Duration::from_millis(capped)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.initial_backoff, Duration::from_millis(100));
        assert_eq!(config.max_backoff, Duration::from_secs(10));
        assert_eq!(config.backoff_multiplier, 2.0);
        assert!(config.jitter);
    }

    #[test]
    fn test_backoff_is_capped() {
        let executor = RetryExecutor::new(RetryConfig {
            jitter: false,
            ..RetryConfig::default()
        });
        assert_eq!(executor.compute_backoff(0), Duration::from_millis(100));
        assert_eq!(executor.compute_backoff(1), Duration::from_millis(200));
        assert_eq!(executor.compute_backoff(20), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_within_half() {
        let executor = RetryExecutor::default();
        for _ in 0..50 {
            let d = executor.compute_backoff(0);
            assert!(d >= Duration::from_millis(100));
            assert!(d < Duration::from_millis(150));
        }
    }

    #[tokio::test]
    async fn test_retry_success_first_attempt() {
        let executor = RetryExecutor::new(fast_config(3));
        let counter = Arc::new(AtomicU32::new(0));

        let counter_clone = Arc::clone(&counter);
        let outcome = executor
            .execute(move || {
                let counter = Arc::clone(&counter_clone);
                async move {
                    counter.fetch_add(1, Ordering::Relaxed);
                    Ok::<_, TransferError>("success")
                }
            })
            .await;

        assert!(matches!(
            outcome,
            RetryOutcome::Success {
                value: "success",
                attempts: 1
            }
        ));
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_then_success() {
        let executor = RetryExecutor::new(fast_config(3));
        let counter = Arc::new(AtomicU32::new(0));

        let counter_clone = Arc::clone(&counter);
        let outcome = executor
            .execute(move || {
                let counter = Arc::clone(&counter_clone);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(TransferError::Injected {
                            operation: "upload".to_string(),
                        })
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;

        assert!(matches!(
            outcome,
            RetryOutcome::Success {
                value: 7,
                attempts: 2
            }
        ));
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let executor = RetryExecutor::new(fast_config(5));
        let counter = Arc::new(AtomicU32::new(0));

        let counter_clone = Arc::clone(&counter);
        let outcome: RetryOutcome<()> = executor
            .execute(move || {
                let counter = Arc::clone(&counter_clone);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(TransferError::PermissionDenied {
                        location: "/repo".to_string(),
                        reason: "denied".to_string(),
                    })
                }
            })
            .await;

        assert!(matches!(
            outcome,
            RetryOutcome::Exhausted { attempts: 1, .. }
        ));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let executor = RetryExecutor::new(fast_config(2));
        let outcome: RetryOutcome<()> = executor
            .execute(|| async {
                Err(TransferError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "reset",
                )))
            })
            .await;

        match outcome {
            RetryOutcome::Exhausted {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 3);
                assert!(matches!(last_error, TransferError::Io(_)));
            }
            RetryOutcome::Success { .. } => panic!("expected exhaustion"),
        }
    }
}
