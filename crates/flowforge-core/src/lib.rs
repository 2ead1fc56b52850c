//! Ports, error taxonomy, and reliability primitives shared across the
//! flowforge orchestration core. Concrete adapters (Redis, in-memory) live
//! in `flowforge-bus` and `flowforge-kv`.

pub mod bus;
pub mod circuit_breaker;
pub mod error;
pub mod idempotency;
pub mod kv;
pub mod retry;

pub use bus::{EnvelopeStream, MessageBus, PublishOptions, SubscribeOptions};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerPermit, CircuitState};
pub use error::{CoreError, Result};
pub use idempotency::{deduplicate, once, DEFAULT_DEDUP_TTL};
pub use kv::{KvStore, Versioned};
pub use retry::{retry, RetryPolicy};
