//! Reconnection backoff schedule

use std::time::Duration;

use tokio_retry::strategy::ExponentialBackoff;

/// Exponential backoff with a cap and a retry budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first reconnection attempt
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Consecutive failed connection attempts tolerated before giving up
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

impl BackoffPolicy {
    /// Delays for successive attempts: initial, then doubling, capped
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let initial_ms = self.initial_delay.as_millis() as u64;
        let first = self.initial_delay.min(self.max_delay);

        std::iter::once(first).chain(
            ExponentialBackoff::from_millis(2)
                .factor(initial_ms.max(1))
                .max_delay(self.max_delay),
        )
    }
}
