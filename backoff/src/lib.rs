//! Bounded retry with backoff for async Rust.
//!
//! An [`Operation`] is run to completion. When it fails, the [`Condition`] decides whether the
//! failure is worth another attempt; if so, the next delay is pulled from the backoff
//! [`strategy`] and the operation is run again after that delay. When the strategy runs dry the
//! last error is returned as [`RetryError::Exhausted`]; a failure the condition refuses is
//! returned immediately as [`RetryError::Permanent`]. Both carry the number of attempts made.
//!
//! ```rust
//! use backoff::retry::Retry;
//! use backoff::strategy::fixed;
//!
//! async fn store_row() -> Result<u64, String> {
//!     Ok(42)
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let interval = fixed::Interval::from_millis(1).take(3);
//!     let result = Retry::new(interval, store_row, |_: &String| true).await;
//!     assert_eq!(result, Ok(42));
//! }
//! ```

use std::fmt;
use std::future::Future;
use std::time::Duration;

/// Backoff strategies. Every strategy is an iterator of delays; bound it with
/// [`take`](std::iter::Iterator::take) to cap the number of retries.
pub mod strategy;

/// The retry future.
pub mod retry;

/// Decides whether a failed attempt may be retried.
pub trait Condition<E> {
    fn can_retry(&self, error: &E) -> bool;
}

impl<E, F> Condition<E> for F
where
    F: Fn(&E) -> bool,
{
    fn can_retry(&self, error: &E) -> bool {
        self(error)
    }
}

/// Anything that can produce a fresh future for every attempt.
pub trait Operation {
    type Item;
    type Error;
    type Future: Future<Output = Result<Self::Item, Self::Error>>;

    #[must_use = "futures do nothing unless you `.await` or poll them"]
    fn run(&mut self) -> Self::Future;
}

impl<T, E, R, F> Operation for F
where
    R: Future<Output = Result<T, E>>,
    F: FnMut() -> R,
{
    type Item = T;
    type Error = E;
    type Future = R;

    fn run(&mut self) -> Self::Future {
        self()
    }
}

/// Observer invoked right before the retry future goes to sleep.
/// `attempt` is the number of the attempt that just failed (1-based).
pub trait Notify<E> {
    fn notify(&mut self, error: &E, attempt: u32, delay: Duration);
}

impl<E, F> Notify<E> for F
where
    F: FnMut(&E, u32, Duration),
{
    fn notify(&mut self, error: &E, attempt: u32, delay: Duration) {
        self(error, attempt, delay)
    }
}

/// A [`Notify`] that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoNotify;

impl<E> Notify<E> for NoNotify {
    fn notify(&mut self, _: &E, _: u32, _: Duration) {}
}

/// Terminal outcome of a retried operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError<E> {
    /// The condition refused to retry this error.
    Permanent { error: E, attempts: u32 },
    /// The strategy ran out of delays before the operation succeeded.
    Exhausted { error: E, attempts: u32 },
}

impl<E> RetryError<E> {
    /// Number of times the operation was run.
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Permanent { attempts, .. } | RetryError::Exhausted { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }

    /// The last error returned by the operation.
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Permanent { error, .. } | RetryError::Exhausted { error, .. } => error,
        }
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Permanent { error, attempts } => {
                write!(f, "{error} (not retried, attempts: {attempts})")
            }
            RetryError::Exhausted { error, attempts } => {
                write!(f, "{error} (retries exhausted, attempts: {attempts})")
            }
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RetryError<E> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_error_accessors() {
        let err: RetryError<&str> = RetryError::Exhausted {
            error: "down",
            attempts: 6,
        };
        assert!(err.is_exhausted());
        assert_eq!(err.attempts(), 6);
        assert_eq!(err.to_string(), "down (retries exhausted, attempts: 6)");
        assert_eq!(err.into_inner(), "down");

        let err: RetryError<&str> = RetryError::Permanent {
            error: "bad row",
            attempts: 1,
        };
        assert!(!err.is_exhausted());
        assert_eq!(err.to_string(), "bad row (not retried, attempts: 1)");
    }
}
