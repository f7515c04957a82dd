use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Bounded exponential backoff for batch appends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total write attempts per flush, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the second attempt.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Multiplier applied per further attempt.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Upper bound for a single delay.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

const fn default_max_attempts() -> u32 {
    4
}

const fn default_initial_backoff_ms() -> u64 {
    50
}

const fn default_backoff_factor() -> f64 {
    2.0
}

const fn default_max_backoff_ms() -> u64 {
    2_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            backoff_factor: default_backoff_factor(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub const fn once() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff_ms: default_initial_backoff_ms(),
            backoff_factor: default_backoff_factor(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }

    pub fn exponential(max_attempts: u32, initial_backoff: Duration, backoff_factor: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff_ms: initial_backoff.as_millis() as u64,
            backoff_factor: if backoff_factor < 1.0 {
                default_backoff_factor()
            } else {
                backoff_factor
            },
            max_backoff_ms: default_max_backoff_ms(),
        }
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff_ms = (max_backoff.as_millis() as u64).max(1);
        self
    }

    /// Whether another attempt may follow `attempts_done` failed attempts.
    pub fn allows_attempt(&self, attempts_done: u32) -> bool {
        attempts_done < self.max_attempts.max(1)
    }

    /// Delay after the `failed_attempt`-th failure (1-based).
    pub fn delay_after(&self, failed_attempt: u32) -> Duration {
        let step = failed_attempt.saturating_sub(1) as i32;
        let raw = self.initial_backoff_ms as f64 * self.backoff_factor.powi(step);
        let capped = raw.round().min(self.max_backoff_ms as f64) as u64;
        Duration::from_millis(capped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn once_allows_a_single_attempt() {
        let p = RetryPolicy::once();
        assert!(p.allows_attempt(0));
        assert!(!p.allows_attempt(1));
    }

    #[test]
    fn delays_grow_until_capped() {
        let p = RetryPolicy::exponential(5, Duration::from_millis(100), 2.0)
            .with_max_backoff(Duration::from_millis(300));
        assert_eq!(p.delay_after(1), Duration::from_millis(100));
        assert_eq!(p.delay_after(2), Duration::from_millis(200));
        assert_eq!(p.delay_after(3), Duration::from_millis(300));
        assert_eq!(p.delay_after(4), Duration::from_millis(300));
    }

    #[test]
    fn missing_fields_take_defaults() {
        let p: RetryPolicy = serde_json::from_str(r#"{"max_attempts": 2}"#).unwrap();
        assert_eq!(p.max_attempts, 2);
        assert_eq!(p.initial_backoff_ms, 50);
    }
}
