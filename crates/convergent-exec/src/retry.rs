//! Exponential-backoff retry with cancellation.
//!
//! [`retry`] and [`retry_if`] run an operation up to
//! [`RetryPolicy::max_attempts`] times, sleeping between attempts with a
//! backoff that grows by [`RetryPolicy::multiplier`] and is capped at
//! [`RetryPolicy::max_backoff`]. Cancelling the token while waiting aborts at
//! once with [`RetryError::Cancelled`]; the last attempt's error is not
//! reported in that case.
//!
//! # Example
//!
//! ```ignore
//! use convergent_exec::retry::{retry, RetryPolicy};
//! use tokio_util::sync::CancellationToken;
//!
//! let policy = RetryPolicy::network("fetch-status");
//! let cancel = CancellationToken::new();
//! let body = retry(&policy, &cancel, |_attempt| fetch()).await?;
//! ```

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::error::ExecError;

/// Immutable description of how an operation is retried.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Wait before the second attempt.
    pub initial_backoff: Duration,
    /// Upper bound for any single wait.
    pub max_backoff: Duration,
    /// Growth factor applied after each wait.
    pub multiplier: f64,
    /// Label used in logs and errors.
    pub operation: String,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new("operation")
    }
}

impl RetryPolicy {
    /// General-purpose policy: 5 attempts, 2s initial, 30s max.
    #[must_use]
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            operation: operation.into(),
        }
    }

    /// Remote-shell dial and handshake: 3 attempts, 1s initial, 10s max.
    #[must_use]
    pub fn remote_shell(operation: impl Into<String>) -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
            ..Self::new(operation)
        }
    }

    /// Package installation: 5 attempts, 3s initial, 60s max.
    #[must_use]
    pub fn package_manager(operation: impl Into<String>) -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(3),
            max_backoff: Duration::from_secs(60),
            ..Self::new(operation)
        }
    }

    /// Network checks: 10 attempts, 2s initial, 30s max.
    #[must_use]
    pub fn network(operation: impl Into<String>) -> Self {
        Self {
            max_attempts: 10,
            ..Self::new(operation)
        }
    }

    /// Set the operation label.
    #[must_use]
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = operation.into();
        self
    }

    /// Set max attempts.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set initial backoff.
    #[must_use]
    pub const fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    /// Set max backoff.
    #[must_use]
    pub const fn with_max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = backoff;
        self
    }

    /// Set multiplier.
    #[must_use]
    pub const fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Attempts actually made; a zero budget still runs once.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// The wait that follows `current`.
    #[must_use]
    pub fn next_backoff(&self, current: Duration) -> Duration {
        let next = current.as_secs_f64() * self.multiplier.max(0.0);
        if next.is_finite() && next < self.max_backoff.as_secs_f64() {
            Duration::from_secs_f64(next)
        } else {
            self.max_backoff
        }
    }

    /// Every wait between attempts, in order.
    ///
    /// The schedule has one entry fewer than [`Self::attempts`].
    #[must_use]
    pub fn backoff_schedule(&self) -> Vec<Duration> {
        let waits = self.attempts() - 1;
        let mut schedule = Vec::with_capacity(waits as usize);
        let mut backoff = self.initial_backoff.min(self.max_backoff);
        for _ in 0..waits {
            schedule.push(backoff);
            backoff = self.next_backoff(backoff);
        }
        schedule
    }
}

/// Why a retried operation gave up.
#[derive(Debug, Error)]
pub enum RetryError<E: std::error::Error + 'static> {
    /// The token was cancelled before or between attempts.
    #[error("{operation}: context cancelled after {attempts} attempts")]
    Cancelled {
        /// The operation label.
        operation: String,
        /// Attempts made.
        attempts: u32,
    },

    /// Every attempt failed with a retryable error.
    #[error("{operation}: failed after {attempts} attempts: {source}")]
    Exhausted {
        /// The operation label.
        operation: String,
        /// Attempts made.
        attempts: u32,
        /// The last error.
        #[source]
        source: E,
    },

    /// An attempt failed with an error the predicate refused to retry.
    #[error("{operation}: {source}")]
    Permanent {
        /// The operation label.
        operation: String,
        /// The error.
        #[source]
        source: E,
    },
}

impl<E: std::error::Error + 'static> RetryError<E> {
    /// Attempts made before giving up, when known.
    #[must_use]
    pub const fn attempts(&self) -> Option<u32> {
        match self {
            Self::Cancelled { attempts, .. } | Self::Exhausted { attempts, .. } => Some(*attempts),
            Self::Permanent { .. } => None,
        }
    }

    /// Check if this is a cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

impl From<RetryError<ExecError>> for ExecError {
    fn from(error: RetryError<ExecError>) -> Self {
        match error {
            RetryError::Cancelled {
                operation,
                attempts,
            } => Self::Cancelled {
                operation,
                attempts,
            },
            RetryError::Exhausted {
                operation,
                attempts,
                source,
            } => Self::RetriesExhausted {
                operation,
                attempts,
                source: Box::new(source),
            },
            RetryError::Permanent { source, .. } => source,
        }
    }
}

/// Retry `op` on every error.
///
/// `op` receives the 1-based attempt number.
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    op: F,
) -> Result<T, RetryError<E>>
where
    E: std::error::Error + 'static,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    retry_if(policy, cancel, op, |_| true).await
}

/// Retry `op` while `is_retryable` accepts its error.
///
/// Errors the predicate rejects are returned immediately as
/// [`RetryError::Permanent`].
pub async fn retry_if<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
    mut is_retryable: P,
) -> Result<T, RetryError<E>>
where
    E: std::error::Error + 'static,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: FnMut(&E) -> bool,
{
    let max_attempts = policy.attempts();
    let mut backoff = policy.initial_backoff.min(policy.max_backoff);
    let mut attempt = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(cancelled(policy, attempt));
        }
        attempt += 1;

        let error = match op(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(
                        operation = %policy.operation,
                        attempt,
                        "operation succeeded after retry"
                    );
                }
                return Ok(value);
            }
            Err(error) => error,
        };

        if !is_retryable(&error) {
            tracing::debug!(
                operation = %policy.operation,
                attempt,
                error = %error,
                "operation failed with a permanent error"
            );
            return Err(RetryError::Permanent {
                operation: policy.operation.clone(),
                source: error,
            });
        }

        if attempt >= max_attempts {
            return Err(RetryError::Exhausted {
                operation: policy.operation.clone(),
                attempts: attempt,
                source: error,
            });
        }

        log_retry(policy, attempt, max_attempts, backoff, &error);

        tokio::select! {
            () = cancel.cancelled() => return Err(cancelled(policy, attempt)),
            () = tokio::time::sleep(backoff) => {}
        }
        backoff = policy.next_backoff(backoff);
    }
}

fn cancelled<E: std::error::Error + 'static>(policy: &RetryPolicy, attempts: u32) -> RetryError<E> {
    tracing::debug!(operation = %policy.operation, attempts, "retry cancelled");
    RetryError::Cancelled {
        operation: policy.operation.clone(),
        attempts,
    }
}

fn log_retry(
    policy: &RetryPolicy,
    attempt: u32,
    max_attempts: u32,
    backoff: Duration,
    error: &impl Display,
) {
    tracing::warn!(
        operation = %policy.operation,
        attempt,
        max_attempts,
        backoff = ?backoff,
        error = %error,
        "operation failed, retrying"
    );
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn presets() {
        let shell = RetryPolicy::remote_shell("ssh");
        assert_eq!(shell.max_attempts, 3);
        assert_eq!(shell.initial_backoff, Duration::from_secs(1));
        assert_eq!(shell.max_backoff, Duration::from_secs(10));

        let pkg = RetryPolicy::package_manager("apt");
        assert_eq!(pkg.max_attempts, 5);
        assert_eq!(pkg.initial_backoff, Duration::from_secs(3));
        assert_eq!(pkg.max_backoff, Duration::from_secs(60));

        let net = RetryPolicy::network("ping");
        assert_eq!(net.max_attempts, 10);
        assert_eq!(net.initial_backoff, Duration::from_secs(2));
        assert_eq!(net.max_backoff, Duration::from_secs(30));

        let default = RetryPolicy::default();
        assert_eq!(default.max_attempts, 5);
        assert!((default.multiplier - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn schedule_doubles_and_caps() {
        let policy = RetryPolicy::package_manager("apt");
        assert_eq!(
            policy.backoff_schedule(),
            vec![
                Duration::from_secs(3),
                Duration::from_secs(6),
                Duration::from_secs(12),
                Duration::from_secs(24),
            ]
        );

        let capped = RetryPolicy::network("net").backoff_schedule();
        assert_eq!(capped.len(), 9);
        assert_eq!(capped[3], Duration::from_secs(16));
        assert_eq!(capped[4], Duration::from_secs(30));
        assert_eq!(capped[8], Duration::from_secs(30));
    }

    #[test]
    fn zero_attempts_still_runs_once() {
        let policy = RetryPolicy::new("x").with_max_attempts(0);
        assert_eq!(policy.attempts(), 1);
        assert!(policy.backoff_schedule().is_empty());
    }

    #[derive(Debug, Error)]
    #[error("{0}")]
    struct Flaky(&'static str);

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_third_attempt_with_doubled_wait() {
        let policy = RetryPolicy::remote_shell("ssh-connect-a");
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let stamps = Arc::new(std::sync::Mutex::new(Vec::new()));

        let result = retry(&policy, &cancel, |_| {
            let calls = Arc::clone(&calls);
            let stamps = Arc::clone(&stamps);
            async move {
                stamps.lock().unwrap().push(tokio::time::Instant::now());
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Flaky("connection refused"))
                } else {
                    Ok("ok")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let stamps = stamps.lock().unwrap();
        assert_eq!(stamps[1] - stamps[0], Duration::from_secs(1));
        assert_eq!(stamps[2] - stamps[1], Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_reports_label_and_count() {
        let policy = RetryPolicy::remote_shell("ssh-connect-a");
        let cancel = CancellationToken::new();
        let result: Result<(), _> =
            retry(&policy, &cancel, |_| async { Err(Flaky("timeout")) }).await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts(), Some(3));
        let text = err.to_string();
        assert!(text.contains("ssh-connect-a"));
        assert!(text.contains("failed after 3 attempts"));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_stops_immediately() {
        let policy = RetryPolicy::remote_shell("op");
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_if(
            &policy,
            &cancel,
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Flaky("bad key")) }
            },
            |_| false,
        )
        .await;

        assert!(matches!(result, Err(RetryError::Permanent { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_backoff_wins() {
        let policy = RetryPolicy::new("slow").with_initial_backoff(Duration::from_secs(60));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        let result: Result<(), _> =
            retry(&policy, &cancel, |_| async { Err(Flaky("refused")) }).await;

        match result {
            Err(RetryError::Cancelled {
                operation,
                attempts,
            }) => {
                assert_eq!(operation, "slow");
                assert_eq!(attempts, 1);
            }
            other => panic!("expected cancellation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn already_cancelled_makes_no_attempt() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = AtomicU32::new(0);
        let result: Result<(), RetryError<Flaky>> = retry(&RetryPolicy::default(), &cancel, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await;

        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn converts_into_exec_error() {
        let err: ExecError = RetryError::Exhausted {
            operation: "ssh-connect-h".into(),
            attempts: 3,
            source: ExecError::handshake("h", "connection reset"),
        }
        .into();
        assert!(matches!(err, ExecError::RetriesExhausted { attempts: 3, .. }));

        let err: ExecError = RetryError::Permanent {
            operation: "ssh-connect-h".into(),
            source: ExecError::no_credentials("h"),
        }
        .into();
        assert!(matches!(err, ExecError::NoCredentials { .. }));
    }
}
