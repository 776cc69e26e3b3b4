//! Reconnect backoff schedule for the serial link.

use std::time::Duration;

/// Default delay after the first failed open attempt.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(2);
/// Longest delay between open attempts.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Exponential backoff policy: start at `base`, double after every failure, never
/// exceed `cap`. Retries are unbounded; the policy only decides how long to wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BASE_DELAY,
            cap: DEFAULT_MAX_DELAY,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap: cap.max(base),
        }
    }

    pub fn start(&self) -> Backoff {
        Backoff {
            policy: *self,
            current: self.base,
        }
    }
}

/// Running backoff state owned by one serial channel.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    current: Duration,
}

impl Backoff {
    /// Delay to wait after the failure that just happened; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.policy.cap);
        delay
    }

    /// Delay the next failure would produce, without advancing.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Back to the base delay, after a successful open.
    pub fn reset(&mut self) {
        self.current = self.policy.base;
    }
}
