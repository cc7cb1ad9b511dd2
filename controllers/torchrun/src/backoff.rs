//! # Fibonacci Backoff
//!
//! Retry delays for reconciliations that fail with a transient error.
//! Sequence with the defaults: 5s, 5s, 10s, 15s, 25s, 40s, ... capped at 300s.

use std::time::Duration;

/// Fibonacci backoff calculator
///
/// Each backoff is the sum of the previous two, capped at `max_seconds`.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    min_seconds: u64,
    prev_seconds: u64,
    current_seconds: u64,
    max_seconds: u64,
}

impl FibonacciBackoff {
    /// Create a new Fibonacci backoff.
    ///
    /// * `min_seconds` - first (and second) delay
    /// * `max_seconds` - cap of the sequence
    #[must_use]
    pub fn new(min_seconds: u64, max_seconds: u64) -> Self {
        Self {
            min_seconds,
            prev_seconds: 0,
            current_seconds: min_seconds,
            max_seconds,
        }
    }

    /// Get the next backoff and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let result = self.current_seconds;
        let next = self.prev_seconds + self.current_seconds;
        self.prev_seconds = self.current_seconds;
        self.current_seconds = std::cmp::min(next, self.max_seconds);
        Duration::from_secs(result)
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.prev_seconds = 0;
        self.current_seconds = self.min_seconds;
    }
}

impl Default for FibonacciBackoff {
    fn default() -> Self {
        Self::new(5, 300)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(backoff: &mut FibonacciBackoff) -> u64 {
        backoff.next_backoff().as_secs()
    }

    #[test]
    fn test_fibonacci_backoff_sequence() {
        let mut backoff = FibonacciBackoff::default();

        assert_eq!(secs(&mut backoff), 5);
        assert_eq!(secs(&mut backoff), 5);
        assert_eq!(secs(&mut backoff), 10);
        assert_eq!(secs(&mut backoff), 15);
        assert_eq!(secs(&mut backoff), 25);
        assert_eq!(secs(&mut backoff), 40);
    }

    #[test]
    fn test_fibonacci_backoff_max_cap() {
        let mut backoff = FibonacciBackoff::new(5, 30);

        assert_eq!(secs(&mut backoff), 5);
        assert_eq!(secs(&mut backoff), 5);
        assert_eq!(secs(&mut backoff), 10);
        assert_eq!(secs(&mut backoff), 15);
        assert_eq!(secs(&mut backoff), 25);
        // 40 would exceed the cap
        assert_eq!(secs(&mut backoff), 30);
        assert_eq!(secs(&mut backoff), 30);
    }

    #[test]
    fn test_fibonacci_backoff_reset() {
        let mut backoff = FibonacciBackoff::default();

        assert_eq!(secs(&mut backoff), 5);
        assert_eq!(secs(&mut backoff), 5);
        assert_eq!(secs(&mut backoff), 10);

        backoff.reset();

        assert_eq!(secs(&mut backoff), 5);
        assert_eq!(secs(&mut backoff), 5);
        assert_eq!(secs(&mut backoff), 10);
    }
}
