//! Activity retry policy

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry configuration applied by the activity coordinator
///
/// Retries are invisible to workflow code: the workflow only observes the
/// final success or the terminal failure once attempts are exhausted or the
/// error type is listed as non-retryable.
///
/// # Example
///
/// ```
/// use durable_replay::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_max_attempts(3)
///     .with_initial_interval(Duration::from_secs(1))
///     .with_non_retryable_error("InvalidAccount");
///
/// assert!(policy.has_attempts_remaining(2));
/// assert!(!policy.has_attempts_remaining(3));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, the first execution included
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    /// Upper bound for any single retry delay
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Multiplier applied to the delay after every retry
    pub backoff_coefficient: f64,

    /// Jitter factor in `0.0..=1.0`; 0.1 spreads delays by ±10%
    #[serde(default)]
    pub jitter: f64,

    /// Error types that end the activity on first occurrence
    #[serde(default)]
    pub non_retryable_errors: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

/// What the coordinator does with a failed attempt
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Make the task visible again after `delay`
    Retry { next_attempt: u32, delay: Duration },
    /// Record a terminal failure in history
    GiveUp,
}

impl RetryPolicy {
    /// Exponential backoff: 5 attempts, 1s initial, 2x, capped at 100s, no jitter
    pub fn exponential() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(100),
            backoff_coefficient: 2.0,
            jitter: 0.0,
            non_retryable_errors: vec![],
        }
    }

    /// Single attempt, never retried
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            backoff_coefficient: 1.0,
            jitter: 0.0,
            non_retryable_errors: vec![],
        }
    }

    /// Constant delay between attempts
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_interval: interval,
            max_interval: interval,
            backoff_coefficient: 1.0,
            jitter: 0.0,
            non_retryable_errors: vec![],
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient.max(1.0);
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Mark an `ActivityError::error_type` as terminal
    pub fn with_non_retryable_error(mut self, error_type: impl Into<String>) -> Self {
        self.non_retryable_errors.push(error_type.into());
        self
    }

    /// Delay before running `attempt` (1-based). The first attempt never waits.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let exponent = (attempt - 2) as i32;
        let base = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exponent);
        let capped = base.min(self.max_interval.as_secs_f64());

        let jittered = if self.jitter > 0.0 && capped > 0.0 {
            let spread = capped * self.jitter;
            let offset = rand::thread_rng().gen_range(-spread..spread);
            (capped + offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }

    /// False when `error_type` is listed as non-retryable
    pub fn should_retry(&self, error_type: Option<&str>) -> bool {
        match error_type {
            Some(error_type) => !self.non_retryable_errors.iter().any(|e| e == error_type),
            None => true,
        }
    }

    pub fn has_attempts_remaining(&self, completed_attempts: u32) -> bool {
        completed_attempts < self.max_attempts
    }

    /// Decide the fate of a failed attempt.
    ///
    /// `budget` is the time left before the ScheduleToClose deadline, if any;
    /// a retry whose backoff would overrun it is not attempted.
    pub fn decide(
        &self,
        failed_attempt: u32,
        retryable: bool,
        error_type: Option<&str>,
        budget: Option<Duration>,
    ) -> RetryDecision {
        if !retryable || !self.should_retry(error_type) {
            return RetryDecision::GiveUp;
        }
        if !self.has_attempts_remaining(failed_attempt) {
            return RetryDecision::GiveUp;
        }

        let next_attempt = failed_attempt + 1;
        let delay = self.delay_for_attempt(next_attempt);
        match budget {
            Some(budget) if delay >= budget => RetryDecision::GiveUp,
            _ => RetryDecision::Retry {
                next_attempt,
                delay,
            },
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_sequence() {
        let policy = RetryPolicy::exponential();

        assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(4));
    }

    #[test]
    fn test_backoff_capped_at_max_interval() {
        let policy = RetryPolicy::exponential().with_max_interval(Duration::from_secs(3));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(3));
    }

    #[test]
    fn test_jitter_stays_within_spread() {
        let policy = RetryPolicy::fixed(Duration::from_secs(10), 5).with_jitter(0.2);
        for _ in 0..50 {
            let delay = policy.delay_for_attempt(2).as_secs_f64();
            assert!((8.0..=12.0).contains(&delay), "delay {delay} out of range");
        }
    }

    #[test]
    fn test_decide_exhausts_after_max_attempts() {
        let policy = RetryPolicy::fixed(Duration::from_secs(1), 3);

        assert_eq!(
            policy.decide(1, true, None, None),
            RetryDecision::Retry {
                next_attempt: 2,
                delay: Duration::from_secs(1)
            }
        );
        assert!(matches!(
            policy.decide(2, true, None, None),
            RetryDecision::Retry { next_attempt: 3, .. }
        ));
        assert_eq!(policy.decide(3, true, None, None), RetryDecision::GiveUp);
    }

    #[test]
    fn test_decide_respects_non_retryable() {
        let policy = RetryPolicy::exponential().with_non_retryable_error("InsufficientFunds");

        assert_eq!(
            policy.decide(1, true, Some("InsufficientFunds"), None),
            RetryDecision::GiveUp
        );
        assert_eq!(policy.decide(1, false, None, None), RetryDecision::GiveUp);
        assert!(matches!(
            policy.decide(1, true, Some("Transient"), None),
            RetryDecision::Retry { .. }
        ));
    }

    #[test]
    fn test_decide_respects_schedule_to_close_budget() {
        let policy = RetryPolicy::fixed(Duration::from_secs(30), 5);
        assert_eq!(
            policy.decide(1, true, None, Some(Duration::from_secs(10))),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn test_serialization_uses_millis() {
        let policy = RetryPolicy::fixed(Duration::from_millis(1500), 2);
        let json = serde_json::to_value(&policy).expect("should serialize");
        assert_eq!(json["initial_interval"], 1500);

        let parsed: RetryPolicy = serde_json::from_value(json).expect("should deserialize");
        assert_eq!(parsed, policy);
    }
}
