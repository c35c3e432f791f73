//! Bounded retry for every outbound call to the stores and the model backend.

use std::future::Future;
use std::iter::Take;
use std::time::Duration;

use backoff::retry::Retry;
use backoff::strategy::exponential::Exponential;
use backoff::strategy::fixed;
use prometheus_client::metrics::counter::Counter;
use tracing::warn;

use crate::config::{BackoffKind, RetryConfig};
use crate::error::{Error, Failure};

enum Delays {
    Fixed(Take<fixed::Interval>),
    Exponential(Take<Exponential>),
}

impl Iterator for Delays {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Delays::Fixed(delays) => delays.next(),
            Delays::Exponential(delays) => delays.next(),
        }
    }
}

/// Runs an operation until it succeeds, fails with an error that is not retryable, or
/// `max_retries` retries have been spent.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    target: &'static str,
    config: RetryConfig,
    retries: Option<Counter>,
}

impl RetryExecutor {
    /// `target` names the dependency in logs, e.g. "hbase".
    pub fn new(target: &'static str, config: RetryConfig) -> Self {
        Self {
            target,
            config,
            retries: None,
        }
    }

    /// Counts every retry in `counter`.
    pub fn with_retry_counter(mut self, counter: Counter) -> Self {
        self.retries = Some(counter);
        self
    }

    fn delays(&self) -> Delays {
        let retries = self.config.max_retries as usize;
        match self.config.backoff {
            BackoffKind::Fixed => {
                Delays::Fixed(fixed::Interval::new(self.config.base_delay).take(retries))
            }
            BackoffKind::Exponential => Delays::Exponential(
                Exponential::new(self.config.base_delay)
                    .max_delay(self.config.max_delay)
                    .take(retries),
            ),
        }
    }

    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T, Failure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = crate::Result<T>>,
    {
        let target = self.target;
        let max_retries = self.config.max_retries;
        let retries = self.retries.as_ref();
        Retry::with_notify(
            self.delays(),
            operation,
            |e: &Error| e.is_retryable(),
            |e: &Error, attempt: u32, delay: Duration| {
                warn!(
                    target_system = target,
                    attempt,
                    max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Call failed, retrying"
                );
                if let Some(counter) = retries {
                    counter.inc();
                }
            },
        )
        .await
        .map_err(|e| {
            if e.is_exhausted() {
                warn!(
                    target_system = target,
                    attempts = e.attempts(),
                    "Retries exhausted"
                );
            }
            Failure::from(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::time::Instant;

    use super::*;

    fn failing_then_ok(
        failures: u32,
        error: Error,
    ) -> (Arc<AtomicU32>, impl FnMut() -> std::future::Ready<crate::Result<&'static str>>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let op = move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(if n < failures {
                Err(error.clone())
            } else {
                Ok("stored")
            })
        };
        (calls, op)
    }

    #[tokio::test(start_paused = true)]
    async fn fails_twice_then_succeeds() {
        let retried = Counter::default();
        let executor = RetryExecutor::new(
            "mysql",
            RetryConfig::fixed(3, Duration::from_secs(1)),
        )
        .with_retry_counter(retried.clone());
        let (calls, op) =
            failing_then_ok(2, Error::StorageUnavailable("connection refused".into()));

        let start = Instant::now();
        let result = executor.execute(op).await;

        assert_eq!(result, Ok("stored"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retried.get(), 2);
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_reports_every_attempt() {
        let executor = RetryExecutor::new("hbase", RetryConfig::fixed(5, Duration::from_secs(5)));
        let (calls, op) = failing_then_ok(u32::MAX, Error::StorageUnavailable("down".into()));

        let failure = executor.execute(op).await.unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 6);
        assert_eq!(failure.attempts, 6);
        assert_eq!(failure.error, Error::StorageUnavailable("down".into()));
    }

    #[tokio::test]
    async fn non_retryable_errors_are_not_retried() {
        let executor =
            RetryExecutor::new("mysql", RetryConfig::fixed(5, Duration::from_millis(1)));
        let (calls, op) = failing_then_ok(1, Error::ConstraintViolation("bad row".into()));

        let failure = executor.execute(op).await.unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(failure, Failure::once(Error::ConstraintViolation("bad row".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn exponential_backoff_grows() {
        let config = RetryConfig {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            backoff: BackoffKind::Exponential,
            max_delay: Duration::from_secs(60),
        };
        let executor = RetryExecutor::new("model", config);
        let (calls, op) = failing_then_ok(3, Error::ModelUnavailable("loading".into()));

        let start = Instant::now();
        assert_eq!(executor.execute(op).await, Ok("stored"));
        // 1s + 2s + 4s
        assert!(start.elapsed() >= Duration::from_secs(7));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn zero_retries_means_one_call() {
        let executor = RetryExecutor::new("hbase", RetryConfig::fixed(0, Duration::from_secs(1)));
        let (calls, op) = failing_then_ok(1, Error::StorageUnavailable("down".into()));

        let failure = executor.execute(op).await.unwrap_err();
        assert_eq!(failure.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
