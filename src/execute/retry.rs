//! Retry backoff policy for task execution.
//!
//! Retryable adapter failures (timeout, idle, transient invocation) are
//! retried with exponential backoff plus jitter; terminal kinds (parse,
//! scope violation, cancelled) fail immediately.

use std::time::Duration;

use crate::config::ExecutionConfig;
use crate::errors::AdapterError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff_ms: 1000,
            max_backoff_ms: 60_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &ExecutionConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff_ms: config.initial_backoff_ms,
            max_backoff_ms: config.max_backoff_ms,
            ..Default::default()
        }
    }

    /// Backoff before retry number `attempt` (0-based), capped, with up to
    /// 25% jitter.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let delay_ms =
            (self.initial_backoff_ms as f64 * self.multiplier.powi(attempt as i32)) as u64;
        let delay_ms = delay_ms.min(self.max_backoff_ms);

        let delay_ms = if self.jitter {
            let jitter_amount = (delay_ms as f64 * 0.25 * rand::random::<f64>()) as u64;
            delay_ms + jitter_amount
        } else {
            delay_ms
        };

        Duration::from_millis(delay_ms)
    }

    /// Whether a failed attempt should be retried.
    pub fn should_retry(&self, error: &AdapterError, attempt: u32) -> bool {
        error.is_retryable() && attempt < self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AdapterErrorKind;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            initial_backoff_ms: 1000,
            max_backoff_ms: 5000,
            multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn backoff_is_exponential() {
        let policy = policy();
        assert_eq!(policy.backoff_delay(0).as_millis(), 1000);
        assert_eq!(policy.backoff_delay(1).as_millis(), 2000);
        assert_eq!(policy.backoff_delay(2).as_millis(), 4000);
    }

    #[test]
    fn backoff_is_capped() {
        let policy = policy();
        // 1000 * 2^5 = 32000, capped at 5000.
        assert_eq!(policy.backoff_delay(5).as_millis(), 5000);
    }

    #[test]
    fn jitter_stays_within_a_quarter() {
        let policy = RetryPolicy {
            jitter: true,
            ..policy()
        };
        for _ in 0..50 {
            let delay = policy.backoff_delay(0).as_millis();
            assert!((1000..=1250).contains(&delay));
        }
    }

    #[test]
    fn retryable_kinds_respect_attempt_budget() {
        let policy = policy();
        let timeout = AdapterError::timeout("a", "t");
        assert!(policy.should_retry(&timeout, 0));
        assert!(policy.should_retry(&timeout, 1));
        assert!(!policy.should_retry(&timeout, 2));
    }

    #[test]
    fn terminal_kinds_never_retry() {
        let policy = policy();
        let parse = AdapterError::parse("a", "bad json");
        let cancelled = AdapterError::cancelled("a");
        let scope = AdapterError::new(AdapterErrorKind::ScopeViolation, "a", "out of scope");
        assert!(!policy.should_retry(&parse, 0));
        assert!(!policy.should_retry(&cancelled, 0));
        assert!(!policy.should_retry(&scope, 0));
    }
}
