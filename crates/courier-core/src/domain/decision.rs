//! Retry decision: what happens to a job after a failed attempt.
//!
//! Deciding is a pure function of the attempt count and the retry budget, so
//! it is testable without a broker, a clock or any I/O. Executing the decision
//! (requeue or fail) is the worker's job.

use std::time::Duration;

use rand::Rng;

use super::errors::QueueError;

/// The next action for a job whose attempt failed.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Return the job to `waiting`, invisible to claims for `delay`.
    Retry { delay: Duration },

    /// Mark the job `failed` permanently.
    Fail { reason: String },
}

impl Decision {
    pub fn should_retry(&self) -> bool {
        matches!(self, Decision::Retry { .. })
    }
}

/// Backoff policy for failed jobs.
///
/// delay = base_delay * multiplier^(attempts - 1), capped at `max_delay`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,

    /// Fraction of the delay (0.0..=1.0) randomly added on top. 0 disables it.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(300),
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Redeliver immediately, no backoff.
    pub fn immediate() -> Self {
        Self {
            base_delay: Duration::ZERO,
            multiplier: 1.0,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        }
    }

    /// Backoff before the next attempt, given `attempts` already made (1-indexed).
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }

    /// `(attempts, max_attempts) -> Retry | Fail`.
    pub fn decide(&self, attempts: u32, max_attempts: u32) -> Decision {
        if attempts >= max_attempts {
            Decision::Fail {
                reason: format!("max attempts reached: {attempts}/{max_attempts}"),
            }
        } else {
            Decision::Retry {
                delay: self.next_delay(attempts),
            }
        }
    }

    /// Like [`decide`](Self::decide), but permanent errors fail right away.
    pub fn decide_after(&self, error: &QueueError, attempts: u32, max_attempts: u32) -> Decision {
        if !error.is_retryable() {
            return Decision::Fail {
                reason: format!("permanent error: {error}"),
            };
        }
        self.decide(attempts, max_attempts)
    }

    /// Spread a delay by up to `jitter * delay`.
    pub fn jittered<R: Rng + ?Sized>(&self, delay: Duration, rng: &mut R) -> Duration {
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let extra = delay.as_secs_f64() * self.jitter * rng.gen_range(0.0..=1.0);
        delay + Duration::from_secs_f64(extra)
    }
}
