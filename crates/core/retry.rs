//! Exponential backoff for failed jobs.

use rand::Rng;
use std::time::Duration;

use crate::error::{Result, TqError};

/// Retry configuration shared by a worker's jobs.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Upper bound on any computed delay.
    pub cap: Duration,
    /// Draw the delay uniformly from `[0, delay]`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            cap: Duration::from_secs(10),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Create a validated policy.
    pub fn new(
        max_retries: u32,
        base_delay: Duration,
        cap: Duration,
        jitter: bool,
    ) -> Result<Self> {
        let policy = Self {
            max_retries,
            base_delay,
            cap,
            jitter,
        };
        policy.validate()?;
        Ok(policy)
    }

    /// Policy that never retries.
    pub fn no_retries() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Set the retry budget.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the base delay.
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the delay cap.
    pub fn cap(mut self, cap: Duration) -> Self {
        self.cap = cap;
        self
    }

    /// Enable or disable jitter.
    pub fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Check the invariants `base_delay > 0` and `cap >= base_delay`.
    pub fn validate(&self) -> Result<()> {
        if self.base_delay.is_zero() {
            return Err(TqError::Config("base_delay must be positive".to_string()));
        }
        if self.cap < self.base_delay {
            return Err(TqError::Config(format!(
                "cap ({:?}) must be >= base_delay ({:?})",
                self.cap, self.base_delay
            )));
        }
        Ok(())
    }

    /// Whether a job that has been claimed `attempts` times may run again.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts <= self.max_retries
    }

    /// Delay before attempt `attempt + 1`, where `attempt` counts from 1.
    pub fn compute_delay(&self, attempt: u32) -> Duration {
        self.compute_delay_with(attempt, &mut rand::rng())
    }

    /// Same as [`compute_delay`](Self::compute_delay) with a caller-supplied RNG.
    pub fn compute_delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let raw = self.backoff(attempt);
        if self.jitter && !raw.is_zero() {
            Duration::from_secs_f64(rng.random_range(0.0..=raw.as_secs_f64()))
        } else {
            raw
        }
    }

    /// `min(cap, base_delay * 2^(attempt-1))` without jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let multiplier = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(multiplier)
            .map_or(self.cap, |delay| delay.min(self.cap))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.base_delay, Duration::from_millis(500));
        assert_eq!(policy.cap, Duration::from_secs(10));
        assert!(policy.jitter);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_retry_policy_without_jitter() {
        let policy = RetryPolicy::default()
            .base_delay(Duration::from_millis(200))
            .cap(Duration::from_secs(5))
            .jitter(false);
        // 0.2 * 2^(3-1) = 0.8
        assert_eq!(policy.compute_delay(3), Duration::from_millis(800));
    }

    #[test]
    fn test_retry_policy_exponential_backoff() {
        let policy = RetryPolicy::default()
            .base_delay(Duration::from_secs(1))
            .cap(Duration::from_secs(60))
            .jitter(false);

        assert_eq!(policy.compute_delay(1), Duration::from_secs(1));
        assert_eq!(policy.compute_delay(2), Duration::from_secs(2));
        assert_eq!(policy.compute_delay(3), Duration::from_secs(4));
        assert_eq!(policy.compute_delay(4), Duration::from_secs(8));
    }

    #[test]
    fn test_retry_policy_capped() {
        let policy = RetryPolicy::default()
            .base_delay(Duration::from_millis(500))
            .cap(Duration::from_secs(1))
            .jitter(false);
        assert_eq!(policy.compute_delay(5), Duration::from_secs(1));
        assert_eq!(policy.compute_delay(64), Duration::from_secs(1));
        assert_eq!(policy.compute_delay(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_retry_policy_attempt_zero_behaves_like_one() {
        let policy = RetryPolicy::default().jitter(false);
        assert_eq!(policy.compute_delay(0), policy.compute_delay(1));
    }

    #[test]
    fn test_retry_policy_with_jitter_stays_in_bounds() {
        let policy = RetryPolicy::default()
            .base_delay(Duration::from_millis(500))
            .cap(Duration::from_secs(1))
            .jitter(true);
        let mut rng = StdRng::seed_from_u64(7);
        let upper = Duration::from_millis(500 * 2);

        for _ in 0..1000 {
            let delay = policy.compute_delay_with(2, &mut rng);
            assert!(delay <= upper, "{:?} exceeds {:?}", delay, upper);
        }
    }

    #[test]
    fn test_retry_policy_jitter_is_seed_deterministic() {
        let policy = RetryPolicy::default();
        let a = policy.compute_delay_with(3, &mut StdRng::seed_from_u64(42));
        let b = policy.compute_delay_with(3, &mut StdRng::seed_from_u64(42));
        assert_eq!(a, b);
    }

    #[test]
    fn test_retry_policy_rejects_cap_below_base() {
        let err = RetryPolicy::new(3, Duration::from_secs(2), Duration::from_secs(1), false)
            .unwrap_err();
        assert!(matches!(err, TqError::Config(_)));
    }

    #[test]
    fn test_retry_policy_rejects_zero_base_delay() {
        let err = RetryPolicy::new(3, Duration::ZERO, Duration::from_secs(1), false).unwrap_err();
        assert!(matches!(err, TqError::Config(_)));
    }

    #[test]
    fn test_should_retry_boundary() {
        let policy = RetryPolicy::no_retries().max_retries(1);
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));

        let none = RetryPolicy::no_retries();
        assert!(!none.should_retry(1));
    }
}
