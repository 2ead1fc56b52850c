//! Circuit breaker, backed by the [`KvStore`] port so state is shared across
//! every orchestrator process protecting the same downstream (spec.md §4.3).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::kv::KvStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Closed -> Open trips on *either* of two conditions (spec.md §4.5):
/// `consecutive_failures >= failure_threshold`, or
/// `requests >= minimum_requests AND failures / requests >= failure_rate_threshold`.
/// Each call the breaker guards is additionally bounded by `timeout_ms`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    /// Minimum calls observed in the current closed-state window before the
    /// failure-rate trigger is allowed to fire.
    pub minimum_requests: u32,
    /// Percentage (0-100) of failures within the window that trips the
    /// breaker once `minimum_requests` is met.
    pub failure_rate_threshold: f64,
    #[serde(with = "duration_millis")]
    pub reset_timeout: Duration,
    /// Per-call timeout applied by the caller around the guarded call.
    #[serde(with = "duration_millis")]
    pub timeout_ms: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            minimum_requests: 10,
            failure_rate_threshold: 50.0,
            reset_timeout: Duration::from_secs(30),
            timeout_ms: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn with_minimum_requests(mut self, minimum: u32) -> Self {
        self.minimum_requests = minimum;
        self
    }

    pub fn with_failure_rate_threshold(mut self, percent: f64) -> Self {
        self.failure_rate_threshold = percent;
        self
    }

    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    pub fn with_timeout_ms(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedState {
    state: CircuitState,
    /// Failures since the last success, reset by any success; drives the
    /// consecutive-failure trigger.
    consecutive_failures: u32,
    /// Calls observed since the window was last reset (closed-state entry
    /// or the last half-open probe); drives the failure-rate trigger.
    request_count: u32,
    /// Failures within `request_count`'s window.
    failure_count: u32,
    success_count: u32,
    opened_at: Option<DateTime<Utc>>,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            request_count: 0,
            failure_count: 0,
            success_count: 0,
            opened_at: None,
        }
    }
}

/// A call permit; must be resolved via [`CircuitBreakerPermit::success`] or
/// [`CircuitBreakerPermit::failure`].
pub struct CircuitBreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
}

impl<'a> CircuitBreakerPermit<'a> {
    pub async fn success(self) -> Result<()> {
        self.breaker.record_success().await
    }

    pub async fn failure(self) -> Result<()> {
        self.breaker.record_failure().await
    }
}

/// Circuit breaker keyed by name, state shared via a [`KvStore`].
pub struct CircuitBreaker {
    key: String,
    config: CircuitBreakerConfig,
    kv: Arc<dyn KvStore>,
}

impl CircuitBreaker {
    pub fn new(key: impl Into<String>, config: CircuitBreakerConfig, kv: Arc<dyn KvStore>) -> Self {
        Self {
            key: key.into(),
            config,
            kv,
        }
    }

    fn storage_key(&self) -> String {
        format!("circuit:{}", self.key)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn allow(&self) -> Result<CircuitBreakerPermit<'_>> {
        let (state, _version) = self.get_state().await?;
        match state.state {
            CircuitState::Closed => Ok(CircuitBreakerPermit { breaker: self }),
            CircuitState::Open => {
                if Self::should_half_open(&state, self.config.reset_timeout) {
                    self.write_state(PersistedState {
                        state: CircuitState::HalfOpen,
                        consecutive_failures: 0,
                        request_count: 0,
                        failure_count: 0,
                        success_count: 0,
                        opened_at: state.opened_at,
                    })
                    .await?;
                    Ok(CircuitBreakerPermit { breaker: self })
                } else {
                    Err(CoreError::CircuitOpen(self.key.clone()))
                }
            }
            CircuitState::HalfOpen => Ok(CircuitBreakerPermit { breaker: self }),
        }
    }

    pub async fn state(&self) -> Result<CircuitState> {
        Ok(self.get_state().await?.0.state)
    }

    /// Per-call timeout a caller should wrap the guarded call with.
    pub fn call_timeout(&self) -> Duration {
        self.config.timeout_ms
    }

    async fn record_success(&self) -> Result<()> {
        let (state, _) = self.get_state().await?;
        match state.state {
            CircuitState::Closed => {
                self.write_state(PersistedState {
                    consecutive_failures: 0,
                    request_count: state.request_count + 1,
                    ..state
                })
                .await
            }
            CircuitState::HalfOpen => {
                let successes = state.success_count + 1;
                if successes >= self.config.success_threshold {
                    self.write_state(PersistedState::default()).await
                } else {
                    self.write_state(PersistedState {
                        success_count: successes,
                        ..state
                    })
                    .await
                }
            }
            CircuitState::Open => Ok(()),
        }
    }

    /// Applies the dual Closed->Open trigger (spec.md §4.5): consecutive
    /// failures reaching `failure_threshold`, or a failure rate over
    /// `failure_rate_threshold` once `minimum_requests` calls have been seen.
    async fn record_failure(&self) -> Result<()> {
        let (state, _) = self.get_state().await?;
        match state.state {
            CircuitState::Closed => {
                let consecutive = state.consecutive_failures + 1;
                let requests = state.request_count + 1;
                let failures = state.failure_count + 1;

                let consecutive_trip = consecutive >= self.config.failure_threshold;
                let rate_trip = requests >= self.config.minimum_requests
                    && (failures as f64 / requests as f64) * 100.0 >= self.config.failure_rate_threshold;

                if consecutive_trip || rate_trip {
                    self.write_state(PersistedState {
                        state: CircuitState::Open,
                        consecutive_failures: consecutive,
                        request_count: requests,
                        failure_count: failures,
                        success_count: 0,
                        opened_at: Some(Utc::now()),
                    })
                    .await
                } else {
                    self.write_state(PersistedState {
                        consecutive_failures: consecutive,
                        request_count: requests,
                        failure_count: failures,
                        ..state
                    })
                    .await
                }
            }
            CircuitState::HalfOpen => {
                self.write_state(PersistedState {
                    state: CircuitState::Open,
                    consecutive_failures: self.config.failure_threshold,
                    request_count: 0,
                    failure_count: 0,
                    success_count: 0,
                    opened_at: Some(Utc::now()),
                })
                .await
            }
            CircuitState::Open => Ok(()),
        }
    }

    fn should_half_open(state: &PersistedState, reset_timeout: Duration) -> bool {
        match state.opened_at {
            Some(opened_at) => {
                let elapsed = Utc::now()
                    .signed_duration_since(opened_at)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                elapsed >= reset_timeout
            }
            None => false,
        }
    }

    async fn get_state(&self) -> Result<(PersistedState, u64)> {
        match self.kv.get_versioned(&self.storage_key()).await? {
            Some(v) => {
                let state: PersistedState = serde_json::from_slice(&v.value)?;
                Ok((state, v.version))
            }
            None => Ok((PersistedState::default(), 0)),
        }
    }

    async fn write_state(&self, state: PersistedState) -> Result<()> {
        let bytes = serde_json::to_vec(&state)?;
        self.kv.set(&self.storage_key(), bytes, None).await
    }

    /// Force the circuit closed (admin/testing operation).
    pub async fn reset(&self) -> Result<()> {
        self.write_state(PersistedState::default()).await
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
    use crate::kv::Versioned;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemKv {
        store: Mutex<std::collections::HashMap<String, (Vec<u8>, u64)>>,
    }

    #[async_trait]
    impl KvStore for MemKv {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            Ok(self.store.lock().unwrap().get(key).map(|(v, _)| v.clone()))
        }

        async fn get_versioned(&self, key: &str) -> Result<Option<Versioned<Vec<u8>>>> {
            Ok(self
                .store
                .lock()
                .unwrap()
                .get(key)
                .map(|(v, ver)| Versioned {
                    value: v.clone(),
                    version: *ver,
                }))
        }

        async fn set(&self, key: &str, value: Vec<u8>, _ttl: Option<Duration>) -> Result<()> {
            let mut store = self.store.lock().unwrap();
            let version = store.get(key).map(|(_, v)| v + 1).unwrap_or(1);
            store.insert(key.to_string(), (value, version));
            Ok(())
        }

        async fn compare_and_swap(
            &self,
            key: &str,
            expected_version: u64,
            value: Vec<u8>,
            _ttl: Option<Duration>,
        ) -> Result<bool> {
            let mut store = self.store.lock().unwrap();
            let current = store.get(key).map(|(_, v)| *v).unwrap_or(0);
            if current != expected_version {
                return Ok(false);
            }
            store.insert(key.to_string(), (value, current + 1));
            Ok(true)
        }

        async fn set_if_absent(&self, key: &str, value: Vec<u8>, _ttl: Option<Duration>) -> Result<bool> {
            let mut store = self.store.lock().unwrap();
            if store.contains_key(key) {
                return Ok(false);
            }
            store.insert(key.to_string(), (value, 1));
            Ok(true)
        }

        async fn del(&self, key: &str) -> Result<()> {
            self.store.lock().unwrap().remove(key);
            Ok(())
        }

        async fn incr(&self, key: &str, by: i64) -> Result<i64> {
            let mut store = self.store.lock().unwrap();
            let (bytes, ver) = store.get(key).cloned().unwrap_or((b"0".to_vec(), 0));
            let current: i64 = String::from_utf8_lossy(&bytes).parse().unwrap_or(0);
            let next = current + by;
            store.insert(key.to_string(), (next.to_string().into_bytes(), ver + 1));
            Ok(next)
        }

        async fn health(&self) -> Result<()> {
            Ok(())
        }
    }

    fn breaker(config: CircuitBreakerConfig) -> CircuitBreaker {
        CircuitBreaker::new("test-service", config, Arc::new(MemKv::default()))
    }

    #[tokio::test]
    async fn starts_closed() {
        let cb = breaker(CircuitBreakerConfig::default());
        assert_eq!(cb.state().await.unwrap(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn opens_after_failure_threshold() {
        let cb = breaker(CircuitBreakerConfig::default().with_failure_threshold(3));
        for _ in 0..3 {
            let permit = cb.allow().await.unwrap();
            permit.failure().await.unwrap();
        }
        assert!(matches!(cb.allow().await, Err(CoreError::CircuitOpen(_))));
    }

    #[tokio::test]
    async fn half_opens_after_reset_timeout_and_closes_on_success_threshold() {
        let cb = breaker(
            CircuitBreakerConfig::default()
                .with_failure_threshold(2)
                .with_success_threshold(2)
                .with_reset_timeout(Duration::from_millis(10)),
        );
        for _ in 0..2 {
            let permit = cb.allow().await.unwrap();
            permit.failure().await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let permit = cb.allow().await.unwrap();
        assert_eq!(cb.state().await.unwrap(), CircuitState::HalfOpen);
        permit.success().await.unwrap();

        let permit = cb.allow().await.unwrap();
        permit.success().await.unwrap();
        assert_eq!(cb.state().await.unwrap(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn failure_in_half_open_reopens() {
        let cb = breaker(
            CircuitBreakerConfig::default()
                .with_failure_threshold(1)
                .with_reset_timeout(Duration::from_millis(5)),
        );
        let permit = cb.allow().await.unwrap();
        permit.failure().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let permit = cb.allow().await.unwrap();
        assert_eq!(cb.state().await.unwrap(), CircuitState::HalfOpen);
        permit.failure().await.unwrap();

        assert!(matches!(cb.allow().await, Err(CoreError::CircuitOpen(_))));
    }

    #[tokio::test]
    async fn opens_on_failure_rate_once_minimum_requests_is_met() {
        let cb = breaker(
            CircuitBreakerConfig::default()
                .with_failure_threshold(100)
                .with_minimum_requests(4)
                .with_failure_rate_threshold(50.0),
        );
        for _ in 0..2 {
            let permit = cb.allow().await.unwrap();
            permit.success().await.unwrap();
        }
        for _ in 0..2 {
            let permit = cb.allow().await.unwrap();
            permit.failure().await.unwrap();
        }
        assert!(matches!(cb.allow().await, Err(CoreError::CircuitOpen(_))));
    }

    #[tokio::test]
    async fn failure_rate_trigger_does_not_fire_below_minimum_requests() {
        let cb = breaker(
            CircuitBreakerConfig::default()
                .with_failure_threshold(100)
                .with_minimum_requests(10)
                .with_failure_rate_threshold(50.0),
        );
        for _ in 0..3 {
            let permit = cb.allow().await.unwrap();
            permit.failure().await.unwrap();
        }
        assert_eq!(cb.state().await.unwrap(), CircuitState::Closed);
    }

    #[test]
    fn default_call_timeout_is_30s() {
        assert_eq!(CircuitBreakerConfig::default().timeout_ms, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn reset_forces_closed() {
        let cb = breaker(CircuitBreakerConfig::default().with_failure_threshold(1));
        let permit = cb.allow().await.unwrap();
        permit.failure().await.unwrap();
        cb.reset().await.unwrap();
        assert_eq!(cb.state().await.unwrap(), CircuitState::Closed);
    }
}
