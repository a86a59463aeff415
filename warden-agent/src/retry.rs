//! Bounded retries with exponential backoff
//!
//! Only errors that classify themselves as transient are retried. Callers
//! get either the value, the full attempt history, or the first fatal error.

use crate::config::RetryConfig;
use rand::Rng;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Error classification used by the retry loop
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

#[derive(Debug)]
pub enum RetryError<E> {
    /// Every attempt failed with a retryable error
    Exhausted {
        operation: String,
        attempts: u32,
        errors: Vec<String>,
        last: E,
    },
    /// A non-retryable error stopped the loop
    Fatal { operation: String, error: E },
    Cancelled { operation: String },
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Exhausted {
                operation,
                attempts,
                last,
                ..
            } => write!(f, "{operation} exhausted after {attempts} attempts: {last}"),
            RetryError::Fatal { operation, error } => write!(f, "{operation} failed: {error}"),
            RetryError::Cancelled { operation } => write!(f, "{operation} cancelled"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RetryError<E> {}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } => *attempts,
            RetryError::Fatal { .. } => 1,
            RetryError::Cancelled { .. } => 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_backoff,
            max_backoff,
            multiplier: 2.0,
            jitter: true,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        let mut policy = Self::new(
            config.max_attempts,
            Duration::from_millis(config.base_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
        );
        policy.jitter = config.jitter;
        policy
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Backoff before retry number `attempt` (0-based), capped at `max_backoff`
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_backoff.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_backoff.as_millis() as f64);
        let ms = if self.jitter {
            // 50-100% of the backoff
            capped * rand::thread_rng().gen_range(0.5..=1.0)
        } else {
            capped
        };
        Duration::from_millis(ms as u64)
    }

    pub async fn run<T, E, F, Fut>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        mut f: F,
    ) -> Result<T, RetryError<E>>
    where
        E: Retryable + fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut errors = Vec::new();
        for attempt in 0..self.max_attempts {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled {
                    operation: operation.to_string(),
                });
            }

            let err = match f().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(operation, attempt = attempt + 1, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            if !err.is_retryable() {
                return Err(RetryError::Fatal {
                    operation: operation.to_string(),
                    error: err,
                });
            }
            errors.push(err.to_string());
            if attempt + 1 == self.max_attempts {
                return Err(RetryError::Exhausted {
                    operation: operation.to_string(),
                    attempts: self.max_attempts,
                    errors,
                    last: err,
                });
            }

            let backoff = self.delay(attempt);
            warn!(operation, attempt = attempt + 1, error = %err, ?backoff, "retrying");
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(RetryError::Cancelled {
                        operation: operation.to_string(),
                    });
                }
                _ = tokio::time::sleep(backoff) => {}
            }
        }

        Err(RetryError::Cancelled {
            operation: operation.to_string(),
        })
    }

    /// Blocking variant for short synchronous operations (file appends)
    pub fn run_blocking<T, E, F>(&self, operation: &str, mut f: F) -> Result<T, RetryError<E>>
    where
        E: Retryable + fmt::Display,
        F: FnMut() -> Result<T, E>,
    {
        let mut errors = Vec::new();
        let mut attempt = 0;
        loop {
            let err = match f() {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            if !err.is_retryable() {
                return Err(RetryError::Fatal {
                    operation: operation.to_string(),
                    error: err,
                });
            }
            errors.push(err.to_string());
            attempt += 1;
            if attempt >= self.max_attempts {
                return Err(RetryError::Exhausted {
                    operation: operation.to_string(),
                    attempts: attempt,
                    errors,
                    last: err,
                });
            }
            warn!(operation, attempt, error = %err, "retrying");
            std::thread::sleep(self.delay(attempt - 1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct Flaky(bool);

    impl fmt::Display for Flaky {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "flaky (retryable: {})", self.0)
        }
    }

    impl Retryable for Flaky {
        fn is_retryable(&self) -> bool {
            self.0
        }
    }

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1), Duration::from_millis(5)).without_jitter()
    }

    #[tokio::test]
    async fn test_succeeds_on_third_attempt() {
        let calls = AtomicU32::new(0);
        let result = fast(3)
            .run("op", &CancellationToken::new(), || async {
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0 | 1 => Err(Flaky(true)),
                    n => Ok(n),
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_every_attempt() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast(2)
            .run("op", &CancellationToken::new(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Flaky(true))
            })
            .await;
        match result {
            Err(RetryError::Exhausted { attempts, errors, .. }) => {
                assert_eq!(attempts, 2);
                assert_eq!(errors.len(), 2);
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast(5)
            .run("op", &CancellationToken::new(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Flaky(false))
            })
            .await;
        assert!(matches!(result, Err(RetryError::Fatal { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancellation_stops_backoff() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<(), RetryError<Flaky>> = fast(3).run("op", &cancel, || async { Ok(()) }).await;
        assert!(matches!(result, Err(RetryError::Cancelled { .. })));
    }

    #[test]
    fn test_blocking_variant() {
        let mut calls = 0;
        let result = fast(3).run_blocking("op", || {
            calls += 1;
            if calls < 3 {
                Err(Flaky(true))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100), Duration::from_millis(1000));
        for attempt in 0..10 {
            assert!(policy.delay(attempt) <= Duration::from_millis(1000));
            assert!(policy.delay(attempt) >= Duration::from_millis(50));
        }
        assert_eq!(policy.clone().without_jitter().delay(2), Duration::from_millis(400));
    }
}
