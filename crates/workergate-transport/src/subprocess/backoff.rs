//! Restart backoff for the worker process
//!
//! Deterministic doubling, capped, reset on every successful readiness
//! signal so delays grow per failure streak rather than per lifetime.

use std::time::Duration;

/// Exponential restart delay state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartBackoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl RestartBackoff {
    /// Create a backoff starting at `initial`, never exceeding `max`
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            next: initial,
        }
    }

    /// Delay the next relaunch will wait
    pub fn peek(&self) -> Duration {
        self.next.min(self.max)
    }

    /// Take the current delay and double the next one
    pub fn schedule(&mut self) -> Duration {
        let delay = self.peek();
        self.next = self.next.saturating_mul(2).min(self.max);
        delay
    }

    /// Return to the initial delay
    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = RestartBackoff::new(Duration::from_millis(100), Duration::from_millis(500));
        assert_eq!(backoff.schedule(), Duration::from_millis(100));
        assert_eq!(backoff.schedule(), Duration::from_millis(200));
        assert_eq!(backoff.schedule(), Duration::from_millis(400));
        assert_eq!(backoff.schedule(), Duration::from_millis(500));
        assert_eq!(backoff.schedule(), Duration::from_millis(500));
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = RestartBackoff::new(Duration::from_millis(50), Duration::from_secs(1));
        backoff.schedule();
        backoff.schedule();
        assert_eq!(backoff.peek(), Duration::from_millis(200));
        backoff.reset();
        assert_eq!(backoff.peek(), Duration::from_millis(50));
    }

    #[test]
    fn test_initial_above_max_is_capped() {
        let mut backoff = RestartBackoff::new(Duration::from_secs(10), Duration::from_secs(2));
        assert_eq!(backoff.schedule(), Duration::from_secs(2));
    }
}
