//! Retry policy and runner.
//!
//! Exponential backoff with jitter, matching the shape used throughout the
//! orchestration core for both stage-level and adapter-level retries.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,
    pub backoff_coefficient: f64,
    /// Jitter factor (0.0-1.0); 0.1 means +/-10% randomness.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

impl RetryPolicy {
    /// The orchestrator's default: 3 attempts, 500ms initial, 10s cap,
    /// 2x backoff, 10% jitter (spec.md §4.7 `retry_strategy` defaults).
    pub fn standard() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(10),
            backoff_coefficient: 2.0,
            jitter: 0.1,
        }
    }

    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
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

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before the given attempt (1-based; attempt 1 is the initial try
    /// and has no delay).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let retry_num = attempt - 1;
        let base = self.initial_interval.as_secs_f64()
            * self.backoff_coefficient.powi(retry_num as i32 - 1);
        let capped = base.min(self.max_interval.as_secs_f64());

        let jittered = if self.jitter > 0.0 {
            let mut rng = rand::thread_rng();
            let range = capped * self.jitter;
            (capped + rng.gen_range(-range..range)).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }

    pub fn has_attempts_remaining(&self, current_attempt: u32) -> bool {
        current_attempt < self.max_attempts
    }
}

impl From<&flowforge_schemas::RetryStrategy> for RetryPolicy {
    fn from(strategy: &flowforge_schemas::RetryStrategy) -> Self {
        Self {
            max_attempts: strategy.max_retries + 1,
            initial_interval: Duration::from_millis(strategy.backoff_ms),
            max_interval: Duration::from_secs(10),
            backoff_coefficient: 2.0,
            jitter: 0.1,
        }
    }
}

/// Run `f` according to `policy`, sleeping between attempts. Returns the
/// first success or the last error once attempts are exhausted.
pub async fn retry<F, Fut, T, E>(policy: &RetryPolicy, mut f: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 1;
    loop {
        match f(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !policy.has_attempts_remaining(attempt) {
                    return Err(err);
                }
                let delay = policy.delay_for_attempt(attempt + 1);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
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
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_backs_off_exponentially_without_jitter() {
        let policy = RetryPolicy::standard().with_jitter(0.0);
        assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(1000));
    }

    #[test]
    fn delay_is_capped_at_max_interval() {
        let policy = RetryPolicy::standard()
            .with_max_interval(Duration::from_secs(1))
            .with_jitter(0.0);
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn retry_stops_after_first_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = retry(&RetryPolicy::standard().with_jitter(0.0), |_attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(42) }
        })
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_exhausts_attempts_and_returns_last_error() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::standard()
            .with_max_attempts(3)
            .with_initial_interval(Duration::from_millis(1))
            .with_jitter(0.0);

        let result: Result<u32, &str> = retry(&policy, |_attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("boom") }
        })
        .await;

        assert_eq!(result, Err("boom"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn conversion_from_stage_retry_strategy() {
        let strategy = flowforge_schemas::RetryStrategy {
            max_retries: 2,
            backoff_ms: 250,
        };
        let policy = RetryPolicy::from(&strategy);
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_interval, Duration::from_millis(250));
    }
}
