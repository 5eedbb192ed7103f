//! Exponential backoff and bounded retry for transient git/network failures.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Exponential backoff with configurable min/max.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl ExponentialBackoff {
    /// Creates a new backoff starting at `initial`, capping at `max`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Returns the current backoff duration.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Advances to the next backoff interval (doubles, capped at max).
    pub fn next(&mut self) {
        self.current = (self.current * 2).min(self.max);
    }

    /// Resets backoff to initial value.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// How many times a transient failure is retried and how long to wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubles per retry.
    #[serde(with = "crate::config::duration_ms")]
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    #[serde(with = "crate::config::duration_ms")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(self.initial_delay, self.max_delay)
    }
}

/// Runs `op`, retrying while it fails with a transient error.
///
/// `on_retry` is invoked with the attempt number and the error before each
/// sleep so callers can surface an informational event. The sleep races
/// `cancel`; cancellation yields [`Error::ClientDisconnected`].
pub async fn retry_transient<T, F, Fut, R>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut on_retry: R,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    R: FnMut(u32, &Error),
{
    let mut backoff = policy.backoff();
    let mut attempt = 0;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < policy.max_retries => {
                attempt += 1;
                tracing::warn!(
                    attempt,
                    delay_ms = backoff.current().as_millis() as u64,
                    error = %err,
                    "transient failure, retrying"
                );
                on_retry(attempt, &err);

                tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::ClientDisconnected),
                    _ = tokio::time::sleep(backoff.current()) => {}
                }
                backoff.next();
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient() -> Error {
        Error::GitOperation {
            message: "Connection reset by peer".to_string(),
            transient: true,
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(500), Duration::from_millis(1500));
        backoff.next();
        assert_eq!(backoff.current(), Duration::from_millis(1000));
        backoff.next();
        assert_eq!(backoff.current(), Duration::from_millis(1500));
        backoff.reset();
        assert_eq!(backoff.current(), Duration::from_millis(500));
    }

    #[test]
    fn default_policy_retries_once() {
        assert_eq!(RetryPolicy::default().max_retries, 1);
        assert_eq!(RetryPolicy::none().max_retries, 0);
    }

    #[tokio::test]
    async fn transient_failure_is_retried_once() {
        let calls = AtomicU32::new(0);
        let mut retries = Vec::new();

        let result = retry_transient(
            &fast_policy(1),
            &CancellationToken::new(),
            |attempt, _| retries.push(attempt),
            || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(transient())
                } else {
                    Ok("pushed")
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), "pushed");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(retries, vec![1]);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let calls = AtomicU32::new(0);

        let result: Result<()> = retry_transient(
            &fast_policy(1),
            &CancellationToken::new(),
            |_, _| {},
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(transient())
            },
        )
        .await;

        assert!(matches!(result, Err(Error::GitOperation { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let calls = AtomicU32::new(0);

        let result: Result<()> = retry_transient(
            &fast_policy(3),
            &CancellationToken::new(),
            |_, _| {},
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::GitOperation {
                    message: "permission denied (publickey)".to_string(),
                    transient: false,
                })
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff_sleep() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let policy = RetryPolicy {
            max_retries: 1,
            initial_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60),
        };

        let result: Result<()> =
            retry_transient(&policy, &cancel, |_, _| {}, || async { Err(transient()) }).await;

        assert!(matches!(result, Err(Error::ClientDisconnected)));
    }
}
