//! Cooperative cancellation and deadlines.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::query::errors::RuntimeError;

/// Shared flag a caller flips to stop a running query.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Fresh, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Deadline plus cancellation token, checked at batch boundaries.
#[derive(Clone, Debug)]
pub struct Deadline {
    started: Instant,
    limit: Option<Duration>,
    token: Option<CancelToken>,
}

impl Deadline {
    /// Starts the clock now.
    pub fn start(limit: Option<Duration>, token: Option<CancelToken>) -> Self {
        Self {
            started: Instant::now(),
            limit,
            token,
        }
    }

    /// Never expires and cannot be cancelled.
    pub fn unbounded() -> Self {
        Self::start(None, None)
    }

    /// Time since the query started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Fails once the token is cancelled or the deadline has passed.
    pub fn check(&self) -> Result<(), RuntimeError> {
        if self.token.as_ref().is_some_and(CancelToken::is_cancelled) {
            return Err(RuntimeError::Cancelled);
        }
        if let Some(limit) = self.limit {
            let elapsed = self.started.elapsed();
            if elapsed >= limit {
                return Err(RuntimeError::Timeout {
                    elapsed_ms: elapsed.as_millis().min(u64::MAX as u128) as u64,
                });
            }
        }
        Ok(())
    }
}

/// Calls [`Deadline::check`] once every `every` ticks.
#[derive(Debug)]
pub struct Ticker {
    every: usize,
    count: usize,
}

impl Ticker {
    /// Checks on the first tick and then every `every` ticks.
    pub fn new(every: usize) -> Self {
        Self {
            every: every.max(1),
            count: 0,
        }
    }

    /// Counts one unit of work.
    pub fn tick(&mut self, deadline: &Deadline) -> Result<(), RuntimeError> {
        let due = self.count % self.every == 0;
        self.count += 1;
        if due {
            deadline.check()?;
        }
        Ok(())
    }
}
