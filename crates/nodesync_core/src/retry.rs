//! Retry decisions as a pure function of elapsed time.

use std::time::Duration;

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait, then try again.
    Retry(Duration),
    /// Stop retrying.
    GiveUp,
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total time allowed for all attempts.
    pub timeout: Duration,
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Upper bound on a single delay.
    pub max_delay: Duration,
    /// Growth factor between delays.
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    /// Creates a policy that gives up after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
        }
    }

    /// Sets the first delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Decides whether attempt number `attempt` (1-based, just failed) is
    /// followed by another one.
    pub fn decide(&self, elapsed: Duration, attempt: u32) -> RetryDecision {
        if elapsed >= self.timeout {
            return RetryDecision::GiveUp;
        }
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let remaining = self.timeout - elapsed;
        let delay = Duration::from_secs_f64(base.min(self.max_delay.as_secs_f64()));
        RetryDecision::Retry(delay.min(remaining))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}
