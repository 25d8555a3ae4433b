//! Exponential backoff with jitter and a bounded attempt budget.

use std::time::Duration;

use rand::Rng;

use crate::config::RetryPolicy;

/// Tracks retry attempts for one connect/reconnect sequence.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    max_attempts: u32,
    jitter: bool,
    attempts: u32,
}

impl Backoff {
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            base: policy.base_delay(),
            cap: policy.max_delay(),
            max_attempts: policy.max_attempts,
            jitter: policy.jitter,
            attempts: 0,
        }
    }

    /// Failed attempts recorded so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Records a failed attempt and returns how long to wait before the next one.
    ///
    /// Returns `None` once the attempt budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempts = self.attempts.saturating_add(1);
        if self.max_attempts > 0 && self.attempts >= self.max_attempts {
            return None;
        }

        let delay = self.ceiling(self.attempts - 1);
        if !self.jitter || delay.is_zero() {
            return Some(delay);
        }

        let millis = delay.as_millis() as u64;
        let jittered = rand::thread_rng().gen_range(millis / 2..=millis);
        Some(Duration::from_millis(jittered))
    }

    /// Un-jittered delay for the given retry index: `min(cap, base * 2^n)`.
    fn ceiling(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.min(31)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32, jitter: bool) -> RetryPolicy {
        RetryPolicy {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_attempts,
            jitter,
        }
    }

    #[test]
    fn test_exponential_growth_is_capped() {
        let mut backoff = Backoff::new(&policy(0, false));
        let delays: Vec<u64> = (0..8)
            .map(|_| backoff.next_delay().unwrap().as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30, 30]);
    }

    #[test]
    fn test_attempt_budget() {
        let mut backoff = Backoff::new(&policy(3, false));
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
        assert_eq!(backoff.attempts(), 3);
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let mut backoff = Backoff::new(&policy(0, true));
        for retry in 0..10u32 {
            let delay = backoff.next_delay().unwrap();
            let ceiling = Duration::from_secs(1)
                .saturating_mul(1 << retry)
                .min(Duration::from_secs(30));
            assert!(delay <= ceiling);
            assert!(delay >= ceiling / 2);
        }
    }

    #[test]
    fn test_very_many_retries_do_not_overflow() {
        let mut backoff = Backoff::new(&policy(0, false));
        for _ in 0..100 {
            assert!(backoff.next_delay().unwrap() <= Duration::from_secs(30));
        }
    }
}
