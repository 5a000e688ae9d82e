//! Reconnect policy and attempt bookkeeping.

use std::time::Duration;

/// Bounded exponential backoff: `min(base * 2^retry, cap)`, at most
/// `max_retries` automatic attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_retries: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1000),
            cap: Duration::from_millis(16_000),
            max_retries: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the reconnect that follows `retry_count` earlier retries.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let factor = 1u32.checked_shl(retry_count).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

/// Retry counter for one attempt sequence.
///
/// Reset on every successful open; a fresh sequence starts with every
/// manual connect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconnectAttempt {
    count: u32,
}

impl ReconnectAttempt {
    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn is_exhausted(&self, policy: &ReconnectPolicy) -> bool {
        self.count >= policy.max_retries
    }

    /// Schedule the next retry, or `None` once the policy is exhausted.
    pub fn schedule(&mut self, policy: &ReconnectPolicy) -> Option<Duration> {
        if self.is_exhausted(policy) {
            return None;
        }
        let delay = policy.delay_for(self.count);
        self.count += 1;
        Some(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(d: Duration) -> u128 {
        d.as_millis()
    }

    #[test]
    fn delay_sequence_doubles_then_caps() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u128> = (0..8).map(|n| ms(policy.delay_for(n))).collect();
        assert_eq!(
            delays,
            vec![1000, 2000, 4000, 8000, 16000, 16000, 16000, 16000]
        );
    }

    #[test]
    fn huge_retry_counts_do_not_overflow() {
        let policy = ReconnectPolicy::default();
        assert_eq!(ms(policy.delay_for(40)), 16000);
        assert_eq!(ms(policy.delay_for(u32::MAX)), 16000);
    }

    #[test]
    fn attempts_stop_after_max_retries() {
        let policy = ReconnectPolicy::default();
        let mut attempt = ReconnectAttempt::default();

        let mut scheduled = Vec::new();
        while let Some(delay) = attempt.schedule(&policy) {
            scheduled.push(ms(delay));
        }

        assert_eq!(scheduled, vec![1000, 2000, 4000, 8000, 16000]);
        assert_eq!(attempt.count(), 5);
        assert!(attempt.is_exhausted(&policy));
        assert_eq!(attempt.schedule(&policy), None);
    }

    #[test]
    fn reset_restarts_sequence() {
        let policy = ReconnectPolicy::default();
        let mut attempt = ReconnectAttempt::default();
        attempt.schedule(&policy);
        attempt.schedule(&policy);
        attempt.reset();

        assert_eq!(attempt.count(), 0);
        assert_eq!(attempt.schedule(&policy), Some(Duration::from_millis(1000)));
    }
}
