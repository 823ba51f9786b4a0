//! Retry decisions for failed attempts.

use crate::job::Job;
use clipforge_abstraction::GenerationError;
use std::time::Duration;

/// What to do with a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue the job; it becomes eligible after `after`.
    Retry {
        /// Retry count once this retry is consumed.
        retry_count: u32,
        /// Backoff before the next attempt.
        after: Duration,
    },
    /// Mark the job terminally failed.
    GiveUp,
}

/// Exponential backoff policy applied to transient failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// When false every failure is final.
    pub enabled: bool,
    /// Delay unit before the exponent is applied.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Backoff multiplier (e.g., 2.0 for exponential backoff).
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy.
    pub fn new(base_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self { enabled: true, base_delay, max_delay, multiplier }
    }

    /// A policy that never retries.
    pub fn disabled() -> Self {
        Self { enabled: false, ..Self::default() }
    }

    /// Turns retries on or off.
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Calculate the delay before retry number `retry_count`.
    ///
    /// Uses exponential backoff: base_delay * multiplier^retry_count, capped at max_delay.
    pub fn calculate_delay(&self, retry_count: u32) -> Duration {
        let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
        let delay_ms = (self.base_delay.as_millis() as f64 * self.multiplier.powi(exponent))
            .min(self.max_delay.as_millis() as f64) as u64;
        Duration::from_millis(delay_ms)
    }

    /// Decides what happens after `job` failed with `error`.
    ///
    /// Pure: the caller applies the decision to the job.
    pub fn on_failure(&self, job: &Job, error: &GenerationError) -> RetryDecision {
        if !self.enabled || !error.is_retryable() || job.retry_count >= job.max_retries {
            return RetryDecision::GiveUp;
        }
        let retry_count = job.retry_count + 1;
        RetryDecision::Retry { retry_count, after: self.calculate_delay(retry_count) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobRequest;

    fn job_with_retries(retry_count: u32, max_retries: u32) -> Job {
        let mut job = Job::new(JobRequest::new("a.png", "x", "haiper_20"), max_retries, 0.2, None);
        job.retry_count = retry_count;
        job
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.calculate_delay(1), Duration::from_secs(2));
        assert_eq!(policy.calculate_delay(2), Duration::from_secs(4));
        assert_eq!(policy.calculate_delay(4), Duration::from_secs(16));
        assert_eq!(policy.calculate_delay(5), Duration::from_secs(30));
        assert_eq!(policy.calculate_delay(40), Duration::from_secs(30));
    }

    #[test]
    fn test_transient_failure_retries_until_exhausted() {
        let policy = RetryPolicy::default();
        let error = GenerationError::transient("503");

        assert_eq!(
            policy.on_failure(&job_with_retries(0, 2), &error),
            RetryDecision::Retry { retry_count: 1, after: Duration::from_secs(2) }
        );
        assert_eq!(
            policy.on_failure(&job_with_retries(1, 2), &error),
            RetryDecision::Retry { retry_count: 2, after: Duration::from_secs(4) }
        );
        assert_eq!(policy.on_failure(&job_with_retries(2, 2), &error), RetryDecision::GiveUp);
    }

    #[test]
    fn test_permanent_and_cancelled_give_up() {
        let policy = RetryPolicy::default();
        let job = job_with_retries(0, 2);
        assert_eq!(policy.on_failure(&job, &GenerationError::permanent("bad")), RetryDecision::GiveUp);
        assert_eq!(policy.on_failure(&job, &GenerationError::Cancelled), RetryDecision::GiveUp);
        assert!(matches!(
            policy.on_failure(&job, &GenerationError::Timeout(Duration::from_secs(60))),
            RetryDecision::Retry { .. }
        ));
    }

    #[test]
    fn test_disabled_policy_never_retries() {
        let policy = RetryPolicy::disabled();
        assert_eq!(
            policy.on_failure(&job_with_retries(0, 2), &GenerationError::transient("503")),
            RetryDecision::GiveUp
        );
    }
}
