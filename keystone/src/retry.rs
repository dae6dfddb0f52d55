//! Bounded retry with exponential backoff.
//!
//! Used by the saga orchestrator for step attempts and by the mesh client for
//! transient transport failures.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{BackoffMultiplier, DelayMs, MaxAttempts};

/// How many times to attempt an operation and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: MaxAttempts,
    /// Delay after the first failed attempt.
    pub initial_delay: DelayMs,
    /// Growth factor applied to the delay after every further failure.
    pub backoff_multiplier: BackoffMultiplier,
    /// Upper bound for any single delay.
    pub max_delay: DelayMs,
}

impl RetryPolicy {
    /// Builds a policy from already validated parts.
    pub const fn new(
        max_attempts: MaxAttempts,
        initial_delay: DelayMs,
        backoff_multiplier: BackoffMultiplier,
        max_delay: DelayMs,
    ) -> Self {
        Self {
            max_attempts,
            initial_delay,
            backoff_multiplier,
            max_delay,
        }
    }

    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: MaxAttempts::one(),
            ..Self::default()
        }
    }

    /// Total attempts allowed.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.into_inner()
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    ///
    /// `initial_delay * multiplier^(attempt - 1)`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.backoff_multiplier.into_inner().powi(exponent);
        let max = self.max_delay.as_duration();
        let delay = self.initial_delay.as_duration().as_secs_f64() * factor;
        if !delay.is_finite() || delay >= max.as_secs_f64() {
            max
        } else {
            Duration::from_secs_f64(delay)
        }
    }

    /// Runs `operation` until it succeeds, `should_retry` rejects the error,
    /// or the attempts are exhausted. Returns the final result and the number
    /// of attempts made.
    pub async fn run<T, E, F, Fut, P>(&self, mut operation: F, should_retry: P) -> (Result<T, E>, u32)
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let max_attempts = self.attempts();
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Ok(value) => return (Ok(value), attempt),
                Err(error) if attempt < max_attempts && should_retry(&error) => {
                    let delay = self.delay_for_attempt(attempt);
                    debug!(
                        attempt,
                        max_attempts,
                        ?delay,
                        "retrying after failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return (Err(error), attempt),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MaxAttempts::default(),
            initial_delay: DelayMs::new(1_000),
            backoff_multiplier: BackoffMultiplier::default(),
            max_delay: DelayMs::new(10_000),
        }
    }
}
