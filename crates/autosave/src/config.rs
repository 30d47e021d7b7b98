use std::time::Duration;

use crate::backup::DEFAULT_BACKUP_MAX_AGE;

/// Exponential backoff for failed saves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Retries after the first attempt; `3` means four attempts in total.
    pub max_retries: u32,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): `min(base * 2^(retry-1), max)`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    pub fn allows(&self, retry: u32) -> bool {
        retry <= self.max_retries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(10_000),
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutosaveConfig {
    /// Quiet period after the last edit before a save fires.
    pub debounce: Duration,
    /// Safety save interval, independent of edit activity.
    pub periodic_interval: Duration,
    pub retry: RetryPolicy,
    pub backup_max_age: Duration,
}

impl Default for AutosaveConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(800),
            periodic_interval: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            backup_max_age: DEFAULT_BACKUP_MAX_AGE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_then_cap() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (1..=6)
            .map(|retry| policy.delay_for(retry).as_millis() as u64)
            .collect();
        assert_eq!(delays, [1_000, 2_000, 4_000, 8_000, 10_000, 10_000]);
    }

    #[test]
    fn huge_retry_numbers_saturate() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_millis(10_000));
    }

    #[test]
    fn default_budget_is_three_retries() {
        let policy = RetryPolicy::default();
        assert!(policy.allows(3));
        assert!(!policy.allows(4));
    }
}
