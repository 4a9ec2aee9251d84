//! Retry policy and the attempt state machine
//!
//! The transition table lives here, away from any engine call, so it can be
//! tested against every path: `pending -> attempting -> (succeeded |
//! retrying -> attempting | failed)`.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff with jitter. Only transient failures consume the
/// attempt budget beyond the first failure; permanent ones stop the run
/// immediately.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_attempts: u32,
    pub max_delay: Duration,
    /// Fractional jitter applied both ways, e.g. 0.2 for ±20%.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_attempts: 3,
            max_delay: Duration::from_secs(60),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt, given how many attempts already
    /// failed. `delay(n) = min(max_delay, initial_delay * multiplier^(n-1))`
    /// with jitter, so the first retry waits roughly `initial_delay`.
    pub fn delay_after(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1);
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent as i32);
        let capped = base.min(self.max_delay.as_secs_f64());

        let jittered = if self.jitter > 0.0 {
            let factor = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
            capped * factor
        } else {
            capped
        };

        Duration::from_secs_f64(jittered.min(self.max_delay.as_secs_f64()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Pending,
    Attempting { attempt: u32 },
    Retrying { next_attempt: u32 },
    Succeeded { attempts: u32 },
    Failed { attempts: u32 },
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    Retry(Duration),
    GiveUp,
}

/// Drives one job's attempts through the retry transition table.
#[derive(Debug)]
pub struct RetrySchedule {
    policy: RetryPolicy,
    state: RetryState,
}

impl RetrySchedule {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            state: RetryState::Pending,
        }
    }

    pub fn state(&self) -> RetryState {
        self.state
    }

    /// `pending|retrying -> attempting`. Returns the 1-based attempt number.
    ///
    /// # Panics
    /// Panics if called from a terminal or already-attempting state; that is
    /// a driver bug, not a runtime condition.
    pub fn begin_attempt(&mut self) -> u32 {
        let attempt = match self.state {
            RetryState::Pending => 1,
            RetryState::Retrying { next_attempt } => next_attempt,
            other => unreachable!("begin_attempt from {other:?}"),
        };
        self.state = RetryState::Attempting { attempt };
        attempt
    }

    /// `attempting -> succeeded`.
    pub fn record_success(&mut self) {
        match self.state {
            RetryState::Attempting { attempt } => {
                self.state = RetryState::Succeeded { attempts: attempt };
            }
            other => unreachable!("record_success from {other:?}"),
        }
    }

    /// `attempting -> retrying | failed`, depending on the error class and
    /// the remaining attempt budget.
    pub fn record_failure(&mut self, transient: bool) -> FailureDisposition {
        match self.state {
            RetryState::Attempting { attempt } => {
                if transient && attempt < self.policy.max_attempts {
                    self.state = RetryState::Retrying {
                        next_attempt: attempt + 1,
                    };
                    FailureDisposition::Retry(self.policy.delay_after(attempt))
                } else {
                    self.state = RetryState::Failed { attempts: attempt };
                    FailureDisposition::GiveUp
                }
            }
            other => unreachable!("record_failure from {other:?}"),
        }
    }

    pub fn attempts(&self) -> u32 {
        match self.state {
            RetryState::Pending => 0,
            RetryState::Attempting { attempt } => attempt,
            RetryState::Retrying { next_attempt } => next_attempt - 1,
            RetryState::Succeeded { attempts } | RetryState::Failed { attempts } => attempts,
        }
    }
}
