//! Linear backoff for registry polling

use std::time::Duration;

/// Retry schedule for registry requests.
///
/// The n-th consecutive failure sleeps `min(n * step, max_delay)`.
/// `max_attempts` exists so callers and tests can bound the loop; the
/// supervisor runs with it unset and retries until the registry answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub step: Duration,
    pub max_delay: Duration,
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            step: Duration::from_secs(10),
            max_delay: Duration::from_secs(300),
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failure (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.step
            .checked_mul(attempt.max(1))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Whether another request may be made after `attempt` failures
    pub fn allows_retry(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt < max)
    }
}
