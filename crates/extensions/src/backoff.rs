//! Retry timing for failed reconciles.
use std::time::Duration;

/// Determines how long to back off before retrying a reconcile.
pub trait BackoffStrategy: Send {
    /// Forgets earlier failures, e.g. after a successful reconcile.
    fn reset(&mut self);
    /// The delay before the next retry. Each call counts as one failure.
    fn next_duration(&mut self) -> Duration;
}

/// Doubles the retry delay after every failure, up to a cap.
#[derive(Clone, Debug)]
pub struct ExponentialBackoffStrategy {
    base: Duration,
    cap: Duration,
    failures: u32,
}

impl Default for ExponentialBackoffStrategy {
    /// 5 seconds, doubling up to 16 minutes.
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(16 * 60))
    }
}

impl ExponentialBackoffStrategy {
    /// Creates a strategy whose first delay is `base` and whose delays never
    /// exceed `cap`.
    pub fn new(base: Duration, cap: Duration) -> Self {
        ExponentialBackoffStrategy {
            base,
            cap,
            failures: 0,
        }
    }
}

impl BackoffStrategy for ExponentialBackoffStrategy {
    fn reset(&mut self) {
        self.failures = 0;
    }

    fn next_duration(&mut self) -> Duration {
        let factor = 2u32.checked_pow(self.failures).unwrap_or(u32::MAX);
        let delay = self
            .base
            .checked_mul(factor)
            .map_or(self.cap, |delay| delay.min(self.cap));
        if delay < self.cap {
            self.failures += 1;
        }
        delay
    }
}
