//! Retry policy

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// `{maxAttempts, initialBackoff, multiplier, jitter, retryableErrors?}`.
/// Attempts = 1 + retries: `max_attempts: 3` means one initial try plus two
/// retries. Backoff between attempt `n` and `n+1` is
/// `initial_backoff * multiplier^(n-1) * (1 ± jitter)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(with = "duration_millis")]
    pub initial_backoff: Duration,
    #[serde(default, with = "option_duration_millis")]
    pub max_backoff: Option<Duration>,
    pub multiplier: f64,
    /// Fraction in `[0, 1]` applied symmetrically around the computed backoff
    pub jitter: f64,
    /// Domain-declared retryable failure kinds, in addition to the built-in
    /// network-error / 5xx / 408 / 429 rules applied by the task executor
    #[serde(default)]
    pub retryable_errors: Option<Vec<String>>,
}

impl RetryPolicy {
    pub fn exponential(max_attempts: u32, initial_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            max_backoff: None,
            multiplier: 2.0,
            jitter: 0.0,
            retryable_errors: None,
        }
    }

    pub fn no_retry() -> Self {
        Self::exponential(1, Duration::ZERO)
    }

    pub fn fixed(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff: interval,
            max_backoff: Some(interval),
            multiplier: 1.0,
            jitter: 0.0,
            retryable_errors: None,
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = Some(max_backoff);
        self
    }

    pub fn with_retryable_errors(mut self, kinds: Vec<String>) -> Self {
        self.retryable_errors = Some(kinds);
        self
    }

    /// `attempts_made` is the count of attempts already consumed (including
    /// the first try); returns whether another attempt may be made.
    pub fn has_attempts_remaining(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    /// Whether a domain-declared failure kind is retryable per this policy.
    /// The built-in network/5xx/408/429 rules are evaluated separately by
    /// the task executor, which has the HTTP status code in hand.
    pub fn is_retryable_kind(&self, kind: &str) -> bool {
        match &self.retryable_errors {
            Some(kinds) => kinds.iter().any(|k| k == kind),
            None => false,
        }
    }

    /// Delay before the attempt following `attempt` (1-indexed: the delay
    /// after the first attempt is `delay_for_attempt(1, ..)`).
    pub fn delay_for_attempt(&self, attempt: u32, rng: &mut impl Rng) -> Duration {
        let base_secs = self.initial_backoff.as_secs_f64() * self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let jittered_secs = if self.jitter > 0.0 {
            let factor = 1.0 + rng.gen_range(-self.jitter..=self.jitter);
            (base_secs * factor).max(0.0)
        } else {
            base_secs
        };
        let mut delay = Duration::from_secs_f64(jittered_secs);
        if let Some(cap) = self.max_backoff {
            delay = delay.min(cap);
        }
        delay
    }
}

/// HTTP status codes the task executor treats as retryable independent of
/// any domain-declared kinds: 408 (timeout), 429 (rate limited), and any 5xx.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429) || (500..600).contains(&status)
}

pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(v: &Duration, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (v.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D>(d: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

pub(crate) mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(v: &Option<Duration>, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        v.map(|d| d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D>(d: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(d)?;
        Ok(millis.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempts_equals_one_plus_retries() {
        let policy = RetryPolicy::exponential(3, Duration::from_millis(100));
        assert!(policy.has_attempts_remaining(0));
        assert!(policy.has_attempts_remaining(2));
        assert!(!policy.has_attempts_remaining(3));
    }

    #[test]
    fn no_retry_allows_exactly_one_attempt() {
        let policy = RetryPolicy::no_retry();
        assert!(policy.has_attempts_remaining(0));
        assert!(!policy.has_attempts_remaining(1));
    }

    #[test]
    fn exponential_backoff_without_jitter() {
        let policy = RetryPolicy::exponential(5, Duration::from_millis(100)).with_multiplier(2.0);
        let mut rng = rand::thread_rng();
        assert_eq!(policy.delay_for_attempt(1, &mut rng), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2, &mut rng), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3, &mut rng), Duration::from_millis(400));
    }

    #[test]
    fn max_backoff_caps_growth() {
        let policy = RetryPolicy::exponential(10, Duration::from_millis(100))
            .with_multiplier(2.0)
            .with_max_backoff(Duration::from_millis(300));
        let mut rng = rand::thread_rng();
        assert_eq!(policy.delay_for_attempt(5, &mut rng), Duration::from_millis(300));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy::exponential(5, Duration::from_millis(100)).with_jitter(0.5);
        let mut rng = rand::thread_rng();
        for attempt in 1..4 {
            let base = 100.0 * 2f64.powi(attempt - 1);
            let delay = policy.delay_for_attempt(attempt as u32, &mut rng).as_secs_f64() * 1000.0;
            assert!(delay >= base * 0.5 - 1.0 && delay <= base * 1.5 + 1.0, "attempt {attempt} delay {delay} out of bounds for base {base}");
        }
    }

    #[test]
    fn retryable_status_codes() {
        assert!(is_retryable_status(408));
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(500));
        assert!(is_retryable_status(503));
        assert!(!is_retryable_status(404));
        assert!(!is_retryable_status(400));
    }

    #[test]
    fn domain_retryable_kinds_are_explicit() {
        let policy = RetryPolicy::exponential(3, Duration::from_millis(10)).with_retryable_errors(vec!["RATE_LIMIT".into()]);
        assert!(policy.is_retryable_kind("RATE_LIMIT"));
        assert!(!policy.is_retryable_kind("VALIDATION_ERROR"));
    }
}
