//! # Exponential Backoff
//!
//! Restart delays for retrying workers. Each delay doubles the previous one
//! until the cap is reached: 100ms, 200ms, 400ms, 800ms, 1.6s, 3s, 3s, ...

use std::time::Duration;

/// Exponential backoff calculator
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// First delay, restored by `reset`
    min: Duration,
    /// Delay returned by the next call to `next_backoff`
    current: Duration,
    /// Upper bound for any delay
    max: Duration,
}

impl ExponentialBackoff {
    #[must_use]
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            current: min,
            max,
        }
    }

    /// Get the next delay and advance the sequence.
    pub fn next_backoff(&mut self) -> Duration {
        let result = self.current;
        self.current = std::cmp::min(self.current.saturating_mul(2), self.max);
        result
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.current = self.min;
    }

    #[must_use]
    pub fn max(&self) -> Duration {
        self.max
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(3))
    }
}
