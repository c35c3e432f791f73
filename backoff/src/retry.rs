use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use std::time::Duration;

use pin_project::pin_project;
use tokio::time::{Sleep, sleep};

use crate::{Condition, NoNotify, Notify, Operation, RetryError};

/// The retry future flips between running the operation and sleeping off the backoff delay:
/// ```no_rust
///  Running --Ok--> Ready(Ok)
///     |
///    Err --condition refuses--> Ready(Permanent)
///     |
///  next delay --None--> Ready(Exhausted)
///     |
///  notify, Sleeping --elapsed--> attempts += 1, Running
/// ```
#[pin_project(project = RetryStateProj)]
enum RetryState<F> {
    Running(#[pin] F),
    Sleeping(#[pin] Sleep),
}

/// Retries an [`Operation`] with delays taken from a backoff strategy.
#[pin_project]
pub struct Retry<I, O, C, N = NoNotify>
where
    O: Operation,
{
    #[pin]
    state: RetryState<O::Future>,
    backoff: I,
    operation: O,
    condition: C,
    notify: N,
    attempts: u32,
}

impl<I, O, C> Retry<I, O, C, NoNotify>
where
    I: Iterator<Item = Duration>,
    O: Operation,
    C: Condition<O::Error>,
{
    pub fn new<II>(backoff: II, operation: O, condition: C) -> Self
    where
        II: IntoIterator<IntoIter = I, Item = Duration>,
    {
        Retry::with_notify(backoff, operation, condition, NoNotify)
    }
}

impl<I, O, C, N> Retry<I, O, C, N>
where
    I: Iterator<Item = Duration>,
    O: Operation,
    C: Condition<O::Error>,
    N: Notify<O::Error>,
{
    /// Same as [`Retry::new`], calling `notify` before every backoff sleep.
    pub fn with_notify<II>(backoff: II, mut operation: O, condition: C, notify: N) -> Self
    where
        II: IntoIterator<IntoIter = I, Item = Duration>,
    {
        Self {
            state: RetryState::Running(operation.run()),
            backoff: backoff.into_iter(),
            operation,
            condition,
            notify,
            attempts: 1,
        }
    }
}

impl<I, O, C, N> Future for Retry<I, O, C, N>
where
    I: Iterator<Item = Duration>,
    O: Operation,
    C: Condition<O::Error>,
    N: Notify<O::Error>,
{
    type Output = Result<O::Item, RetryError<O::Error>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        loop {
            let this = self.as_mut().project();
            match this.state.project() {
                RetryStateProj::Running(fut) => {
                    let error = match ready!(fut.poll(cx)) {
                        Ok(item) => return Poll::Ready(Ok(item)),
                        Err(error) => error,
                    };
                    let attempts = *this.attempts;
                    if !this.condition.can_retry(&error) {
                        return Poll::Ready(Err(RetryError::Permanent { error, attempts }));
                    }
                    let Some(delay) = this.backoff.next() else {
                        return Poll::Ready(Err(RetryError::Exhausted { error, attempts }));
                    };
                    this.notify.notify(&error, attempts, delay);
                    self.as_mut()
                        .project()
                        .state
                        .set(RetryState::Sleeping(sleep(delay)));
                }
                RetryStateProj::Sleeping(delay) => {
                    ready!(delay.poll(cx));
                    let mut this = self.as_mut().project();
                    *this.attempts += 1;
                    let next = this.operation.run();
                    this.state.set(RetryState::Running(next));
                }
            }
        }
    }
}
