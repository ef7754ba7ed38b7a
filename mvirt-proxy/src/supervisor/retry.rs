//! Bounded retry with a fixed interval.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    /// Connecting to the runtime: 20 attempts, 100ms apart.
    pub const RECONNECT: RetryPolicy = RetryPolicy::new(20, Duration::from_millis(100));

    /// Delivering a signal through the runtime: 5 attempts, 100ms apart.
    pub const SIGNAL: RetryPolicy = RetryPolicy::new(5, Duration::from_millis(100));

    pub const fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }

    /// Sleep for one interval.
    pub async fn pause(&self) {
        tokio::time::sleep(self.interval).await;
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::RECONNECT
    }
}
