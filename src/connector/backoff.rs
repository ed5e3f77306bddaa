//! Exponential reconnect backoff.

use std::time::Duration;

use crate::config::BackoffConfig;

/// Delay schedule for consecutive reconnect attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            current: config.initial_delay,
            config,
            attempts: 0,
        }
    }

    /// Delay before the next attempt, or `None` once the retry ceiling is hit.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.config.max_retries {
            if self.attempts >= max {
                return None;
            }
        }
        self.attempts += 1;
        let delay = self.current;
        self.current = self
            .current
            .mul_f64(self.config.factor)
            .min(self.config.max_delay);
        Some(delay)
    }

    /// Attempts handed out since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Back to the initial delay after a successful connect.
    pub fn reset(&mut self) {
        self.current = self.config.initial_delay;
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_retries: Option<u32>) -> BackoffConfig {
        BackoffConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            factor: 2.0,
            max_retries,
        }
    }

    #[test]
    fn test_doubles_up_to_ceiling() {
        let mut backoff = Backoff::new(config(None));
        let delays: Vec<u64> = (0..6)
            .map(|_| backoff.next_delay().unwrap().as_secs())
            .collect();

        assert_eq!(delays, vec![1, 2, 4, 8, 10, 10]);
    }

    #[test]
    fn test_retry_ceiling() {
        let mut backoff = Backoff::new(config(Some(2)));

        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
        assert_eq!(backoff.attempts(), 2);
    }

    #[test]
    fn test_reset_restarts_schedule() {
        let mut backoff = Backoff::new(config(Some(3)));
        backoff.next_delay();
        backoff.next_delay();

        backoff.reset();

        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
        assert_eq!(backoff.attempts(), 1);
    }
}
