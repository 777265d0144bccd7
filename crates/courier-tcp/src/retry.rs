//! Re-listen bookkeeping after unintended listener closes.

use std::time::Duration;

/// What to do after the listener closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseAction {
    /// `close()` was called; stay closed.
    Stop,
    /// Re-listen after the delay.
    Relisten(Duration),
    /// No retries configured; stay closed.
    NoRetry,
    /// Budget spent; stay closed permanently.
    Exhausted {
        /// Attempts made before giving up.
        attempts: u32,
    },
}

/// Retry budget and counter for one server instance.
///
/// The counter only ever grows: a successful re-listen does not reset it.
#[derive(Debug, Clone)]
pub struct RetryState {
    max_attempts: u32,
    delay: Duration,
    attempts: u32,
    manually_terminated: bool,
}

impl RetryState {
    /// Budget of `max_attempts` re-listens, each after `delay`.
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            attempts: 0,
            manually_terminated: false,
        }
    }

    /// Record that `close()` was called. Later closes never retry.
    pub fn terminate(&mut self) {
        self.manually_terminated = true;
    }

    /// Whether `close()` was called.
    pub fn is_terminated(&self) -> bool {
        self.manually_terminated
    }

    /// Re-listens performed so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Decide what happens after a close, consuming one attempt if a
    /// re-listen is scheduled.
    pub fn on_close(&mut self) -> CloseAction {
        if self.manually_terminated {
            return CloseAction::Stop;
        }
        if self.max_attempts == 0 {
            return CloseAction::NoRetry;
        }
        if self.attempts >= self.max_attempts {
            return CloseAction::Exhausted {
                attempts: self.attempts,
            };
        }
        self.attempts += 1;
        CloseAction::Relisten(self.delay)
    }
}
