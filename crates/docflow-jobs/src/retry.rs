//! Retry policy for failed pipeline attempts.

use std::time::Duration;

use docflow_core::{defaults, ErrorKind};

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run the job again after the delay.
    Retry(Duration),
    /// Mark the job failed.
    GiveUp,
}

/// Exponential backoff with a hard attempt limit.
///
/// `attempt_count` passed to [`RetryPolicy::decide`] already includes the
/// attempt that just failed, so a job never runs more than `max_attempts`
/// times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: i32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: defaults::MAX_ATTEMPTS,
            base_delay: Duration::from_millis(defaults::RETRY_BASE_MS),
            max_delay: Duration::from_millis(defaults::RETRY_MAX_MS),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: i32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn decide(&self, kind: ErrorKind, attempt_count: i32) -> RetryDecision {
        if kind == ErrorKind::Terminal || attempt_count >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry(self.backoff(attempt_count))
    }

    /// `base * 2^attempt`, capped at `max_delay`.
    pub fn backoff(&self, attempt: i32) -> Duration {
        let factor = 1u32.checked_shl(attempt.max(0) as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(100), Duration::from_millis(1_000))
    }

    #[test]
    fn test_terminal_never_retries() {
        assert_eq!(policy().decide(ErrorKind::Terminal, 1), RetryDecision::GiveUp);
    }

    #[test]
    fn test_retryable_backs_off_exponentially() {
        let p = policy();
        assert_eq!(
            p.decide(ErrorKind::Retryable, 1),
            RetryDecision::Retry(Duration::from_millis(200))
        );
        assert_eq!(
            p.decide(ErrorKind::Retryable, 2),
            RetryDecision::Retry(Duration::from_millis(400))
        );
    }

    #[test]
    fn test_gives_up_at_max_attempts() {
        assert_eq!(policy().decide(ErrorKind::Retryable, 3), RetryDecision::GiveUp);
        assert_eq!(policy().decide(ErrorKind::Retryable, 7), RetryDecision::GiveUp);
    }

    #[test]
    fn test_backoff_is_capped() {
        let p = policy();
        assert_eq!(p.backoff(5), Duration::from_millis(1_000));
        assert_eq!(p.backoff(64), Duration::from_millis(1_000));
    }

    #[test]
    fn test_max_attempts_at_least_one() {
        let p = RetryPolicy::default().with_max_attempts(0);
        assert_eq!(p.max_attempts, 1);
        assert_eq!(p.decide(ErrorKind::Retryable, 1), RetryDecision::GiveUp);
    }

    #[test]
    fn test_defaults() {
        let p = RetryPolicy::default();
        assert_eq!(p.max_attempts, defaults::MAX_ATTEMPTS);
        assert_eq!(p.base_delay, Duration::from_millis(defaults::RETRY_BASE_MS));
    }
}
