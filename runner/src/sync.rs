use parking_lot::{Condvar, Mutex};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PollError<E> {
    #[error("Polling was cancelled")]
    Cancelled,
    #[error("Polling gave up after {0} attempts")]
    Exhausted(u32),
    #[error("Polling step failed: {0}")]
    Step(E),
}

/// Shared cancellation flag with an interruptible sleep
///
/// Cloning hands out another handle to the same flag. Cancelling wakes every sleeper.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    cancelled: Mutex<bool>,
    wakeup: Condvar,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        *self.inner.cancelled.lock() = true;
        self.inner.wakeup.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancelled.lock()
    }

    /// sleep for `duration` unless cancelled first, returns whether the sleep ran to completion
    pub fn sleep(&self, duration: Duration) -> bool {
        let until = Instant::now() + duration;
        let mut cancelled = self.inner.cancelled.lock();

        while !*cancelled {
            if self.inner.wakeup.wait_until(&mut cancelled, until).timed_out() {
                return !*cancelled;
            }
        }

        false
    }
}

/// Result of a single polling step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Poll<T> {
    Ready(T),
    Pending,
}

/// Repeat {step; check cancellation; sleep(backoff)} until the step is ready
///
/// Bounded by the token, an optional deadline and an optional number of attempts. The deadline
/// is checked between steps, a step that is already running is never interrupted.
#[derive(Debug, Clone)]
pub struct Poller {
    token: CancellationToken,
    backoff: Duration,
    deadline: Option<Instant>,
    max_attempts: Option<u32>,
}

impl Poller {
    pub fn new(token: CancellationToken, backoff: Duration) -> Self {
        Self {
            token,
            backoff,
            deadline: None,
            max_attempts: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    fn expired(&self) -> bool {
        self.token.is_cancelled()
            || self
                .deadline
                .map(|deadline| Instant::now() >= deadline)
                .unwrap_or(false)
    }

    pub fn run<T, E, F>(&self, mut step: F) -> Result<T, PollError<E>>
    where
        F: FnMut(u32) -> Result<Poll<T>, E>,
    {
        let mut attempt = 0;

        loop {
            if self.expired() {
                debug!(attempt, "Polling stopped before completion");

                return Err(PollError::Cancelled);
            }

            attempt += 1;
            match step(attempt).map_err(PollError::Step)? {
                Poll::Ready(value) => return Ok(value),
                Poll::Pending => trace!(attempt, "Polling step not ready yet"),
            }

            if self.max_attempts.map(|max| attempt >= max).unwrap_or(false) {
                return Err(PollError::Exhausted(attempt));
            }

            let pause = match self.deadline {
                Some(deadline) => self
                    .backoff
                    .min(deadline.saturating_duration_since(Instant::now())),
                None => self.backoff,
            };

            if !self.token.sleep(pause) {
                return Err(PollError::Cancelled);
            }
        }
    }
}
