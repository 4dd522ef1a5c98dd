//! Bounded retry with linear backoff.
//!
//! [`RetryPolicy::run`] wraps an operation returning `Result<(bool, T), E>`:
//!
//! - `Ok((true, v))` → success, returned immediately.
//! - `Ok((false, v))` → a reported failure. Returned as-is, never retried.
//! - `Err(e)` with `e.is_transient()` → wait `backoff * attempt` and try
//!   again, until `max_attempts` attempts have been made.
//! - `Err(e)` otherwise → fatal, no further attempts.
//!
//! Only raised errors are retried; an operation that deliberately reports
//! failure has already decided the outcome.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};

/// Failure classes that may succeed on a later attempt.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(5))
    }
}

/// Result of running an operation under a [`RetryPolicy`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome<T> {
    /// The operation returned `(true, value)` on attempt `attempts`.
    Succeeded { value: T, attempts: u32 },
    /// The operation returned `(false, value)`; not retried.
    Declined(T),
    /// Every attempt raised a transient error.
    Exhausted { attempts: u32, last_error: String },
    /// A non-transient error on attempt `attempt`.
    Fatal { attempt: u32, error: String },
}

impl<T> RetryOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, RetryOutcome::Succeeded { .. })
    }

    /// `(true, Some(v))` on success, `(false, Some(v))` for a declined
    /// result, `(false, None)` after exhaustion or a fatal error.
    pub fn into_parts(self) -> (bool, Option<T>) {
        match self {
            RetryOutcome::Succeeded { value, .. } => (true, Some(value)),
            RetryOutcome::Declined(value) => (false, Some(value)),
            RetryOutcome::Exhausted { .. } | RetryOutcome::Fatal { .. } => (false, None),
        }
    }
}

impl RetryPolicy {
    /// `max_attempts` is clamped to at least one.
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    pub fn from_secs(max_attempts: u32, backoff_secs: u64) -> Self {
        Self::new(max_attempts, Duration::from_secs(backoff_secs))
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Wait before the attempt following `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff * attempt
    }

    /// Run `op` until it succeeds, reports failure, fails fatally, or runs
    /// out of attempts. `op` receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut op: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<(bool, T), E>>,
        E: Transient + Display,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok((true, value)) => return RetryOutcome::Succeeded { value, attempts: attempt },
                Ok((false, value)) => return RetryOutcome::Declined(value),
                Err(e) if e.is_transient() => {
                    warn!(
                        %label,
                        attempt,
                        max_attempts = self.max_attempts,
                        "attempt failed: {}",
                        e
                    );
                    if attempt >= self.max_attempts {
                        warn!(%label, "giving up after {} attempts", self.max_attempts);
                        return RetryOutcome::Exhausted {
                            attempts: attempt,
                            last_error: e.to_string(),
                        };
                    }
                    let wait = self.delay_after(attempt);
                    info!(%label, wait_secs = wait.as_secs_f64(), "retrying");
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(%label, attempt, "unexpected error, not retrying: {}", e);
                    return RetryOutcome::Fatal {
                        attempt,
                        error: e.to_string(),
                    };
                }
            }
        }
    }
}
