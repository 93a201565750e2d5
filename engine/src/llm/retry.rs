//! Bounded exponential backoff for provider calls.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Attempt budget and backoff curve (`base^attempt` seconds, capped).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first.
    pub max_attempts: u32,
    /// Exponential base, in seconds.
    pub base_secs: f64,
    /// Upper bound on a single backoff delay.
    pub max_backoff_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Backoff after the failed attempt `attempt` (0-indexed).
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let secs = self.base_secs.powi(attempt.min(i32::MAX as u32) as i32);
        let ms = (secs * 1000.0).max(0.0);
        if !ms.is_finite() {
            return self.max_backoff_ms;
        }
        (ms as u64).min(self.max_backoff_ms)
    }

    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms(attempt))
    }

    /// Whether another attempt is allowed after `attempt` (0-indexed) failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt.saturating_add(1) < self.max_attempts
    }
}

impl Default for RetryPolicy {
    /// 10 attempts, 1.5s base, 60s cap.
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_secs: 1.5,
            max_backoff_ms: 60_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_exponential() {
        let p = RetryPolicy::default();
        assert_eq!(p.backoff_ms(0), 1_000);
        assert_eq!(p.backoff_ms(1), 1_500);
        assert_eq!(p.backoff_ms(2), 2_250);
        assert_eq!(p.backoff_ms(3), 3_375);
    }

    #[test]
    fn test_backoff_is_capped() {
        let p = RetryPolicy {
            max_backoff_ms: 5_000,
            ..RetryPolicy::default()
        };
        assert_eq!(p.backoff_ms(30), 5_000);
        assert_eq!(p.backoff_ms(u32::MAX), 5_000);
    }

    #[test]
    fn test_should_retry_counts_first_attempt() {
        let p = RetryPolicy::new(3);
        assert!(p.should_retry(0));
        assert!(p.should_retry(1));
        assert!(!p.should_retry(2));
        assert!(!p.should_retry(u32::MAX));
    }
}
