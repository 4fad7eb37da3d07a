//! Retry policy for transient storage errors.
//!
//! Only [`ErrorKind::SessionNotYetVisible`](crate::errors::ErrorKind) is
//! retried; every other error is returned on the first occurrence.  The
//! default policy is bounded with exponential backoff; [`RetryPolicy::unbounded`]
//! retries forever with no delay.

use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::errors::{Operation, StorageError, UploadError};
use crate::metrics::TRANSIENT_RETRIES_TOTAL;

/// Attempts per call under the default policy.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// How the delay between attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    None,
    Linear,
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per call, including the first.  `None` = unbounded.
    pub max_attempts: Option<u32>,
    pub backoff: Backoff,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Some(DEFAULT_MAX_ATTEMPTS),
            backoff: Backoff::Exponential,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Retry forever, immediately.
    pub fn unbounded() -> Self {
        Self {
            max_attempts: None,
            backoff: Backoff::None,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// At most `max_attempts` attempts, no delay between them.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            ..Self::unbounded()
        }
    }

    /// Whether attempt number `attempt` (1-based) may be made.
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt <= max)
    }

    /// Delay to wait after `failures` consecutive transient failures.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let delay = match self.backoff {
            Backoff::None => Duration::ZERO,
            Backoff::Linear => self.base_delay.saturating_mul(failures),
            Backoff::Exponential => {
                let factor = 1u32.checked_shl(failures.saturating_sub(1)).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        };
        delay.min(self.max_delay)
    }

    /// Drive `call` until it succeeds, fails fatally, or the budget runs out.
    ///
    /// `is_cancelled` is checked before every attempt; once it returns true
    /// the loop stops with [`UploadError::Aborted`].
    pub async fn run<T, F, Fut, C>(
        &self,
        operation: Operation,
        is_cancelled: C,
        mut call: F,
    ) -> Result<T, UploadError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
        C: Fn() -> bool,
    {
        let mut attempt: u32 = 0;
        loop {
            if is_cancelled() {
                return Err(UploadError::Aborted);
            }
            attempt += 1;

            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() => {
                    if !self.allows(attempt + 1) {
                        return Err(UploadError::RetriesExhausted {
                            operation,
                            attempts: attempt,
                            last: err,
                        });
                    }

                    metrics::counter!(TRANSIENT_RETRIES_TOTAL, "operation" => operation.as_str())
                        .increment(1);

                    let delay = self.delay_for(attempt);
                    warn!(
                        "{} not yet visible (attempt {}), retrying in {:?}",
                        operation, attempt, delay
                    );
                    if delay.is_zero() {
                        tokio::task::yield_now().await;
                    } else {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(err) => return Err(UploadError::Storage(err)),
            }
        }
    }
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    fn transient() -> StorageError {
        StorageError::new(
            ErrorKind::SessionNotYetVisible,
            Operation::UploadPart,
            "not yet",
        )
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, Some(10));
        assert!(policy.allows(10));
        assert!(!policy.allows(11));
    }

    #[test]
    fn test_unbounded_allows_everything() {
        let policy = RetryPolicy::unbounded();
        assert!(policy.allows(u32::MAX));
        assert_eq!(policy.delay_for(1000), Duration::ZERO);
    }

    #[test]
    fn test_linear_delay() {
        let policy = RetryPolicy {
            max_attempts: None,
            backoff: Backoff::Linear,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(3), Duration::from_millis(300));
        assert_eq!(policy.delay_for(4), Duration::from_millis(350));
    }

    #[test]
    fn test_exponential_delay_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for(10), Duration::from_secs(5));
        assert_eq!(policy.delay_for(64), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_run_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = RetryPolicy::immediate(10)
            .run(Operation::UploadPart, || false, || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 3 {
                        Err(transient())
                    } else {
                        Ok("etag")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "etag");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_run_exhaustion_reports_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::immediate(10)
            .run(Operation::CompleteSession, || false, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(transient()) }
            })
            .await;

        match result {
            Err(UploadError::RetriesExhausted {
                operation,
                attempts,
                last,
            }) => {
                assert_eq!(operation, Operation::CompleteSession);
                assert_eq!(attempts, 10);
                assert_eq!(last.kind, ErrorKind::SessionNotYetVisible);
            }
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_run_fatal_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::unbounded()
            .run(Operation::AbortSession, || false, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(StorageError::new(
                        ErrorKind::AccessDenied,
                        Operation::AbortSession,
                        "denied",
                    ))
                }
            })
            .await;

        assert!(matches!(result, Err(UploadError::Storage(ref e)) if e.kind == ErrorKind::AccessDenied));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_stops_when_cancelled() {
        let cancelled = AtomicBool::new(false);
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::unbounded()
            .run(
                Operation::UploadPart,
                || cancelled.load(Ordering::SeqCst),
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    cancelled.store(true, Ordering::SeqCst);
                    async { Err(transient()) }
                },
            )
            .await;

        assert!(matches!(result, Err(UploadError::Aborted)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_sleeps_between_attempts() {
        let calls = AtomicU32::new(0);
        let start = tokio::time::Instant::now();
        let result = RetryPolicy::default()
            .run(Operation::UploadPart, || false, || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(transient())
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        assert!(result.is_ok());
        // 100ms after the first failure, 200ms after the second.
        assert!(start.elapsed() >= Duration::from_millis(300));
    }
}
