use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential retry backoff with a ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 2_000,
            max_delay_ms: 60_000,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base_delay_ms: base.as_millis() as u64,
            max_delay_ms: max.as_millis() as u64,
        }
    }

    /// Delay before retrying after `failed_attempt` (1-based) failed:
    /// `base * 2^(failed_attempt - 1)`, capped at the ceiling.
    pub fn delay_after(&self, failed_attempt: u32) -> Duration {
        let exp = failed_attempt.saturating_sub(1).min(63);
        let factor = 1u64.checked_shl(exp).unwrap_or(u64::MAX);
        let delay = self.base_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_from_base() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_secs(2));
        assert_eq!(policy.delay_after(2), Duration::from_secs(4));
        assert_eq!(policy.delay_after(3), Duration::from_secs(8));
    }

    #[test]
    fn test_capped_at_ceiling() {
        let policy = BackoffPolicy::new(Duration::from_secs(2), Duration::from_secs(10));
        assert_eq!(policy.delay_after(4), Duration::from_secs(10));
        assert_eq!(policy.delay_after(200), Duration::from_secs(10));
    }

    #[test]
    fn test_zero_base_means_immediate_retry() {
        let policy = BackoffPolicy::new(Duration::ZERO, Duration::from_secs(10));
        assert_eq!(policy.delay_after(5), Duration::ZERO);
    }
}
