//! KV store port: small atomic primitives the rest of the core is built on
//! (locks, CAS-based state, counters). Concrete adapters live in
//! `flowforge-kv`.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

/// A versioned value returned by [`KvStore::get_versioned`], used for
/// compare-and-swap writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: u64,
}

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Fetch the raw bytes stored at `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Fetch the raw bytes and version at `key`, if any.
    async fn get_versioned(&self, key: &str) -> Result<Option<Versioned<Vec<u8>>>>;

    /// Unconditionally set `key` to `value`, optionally with a TTL.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()>;

    /// Set `key` to `value` only if the current version matches `expected`.
    /// Returns `Ok(false)` on mismatch instead of erroring, so callers can
    /// retry their own read-modify-write loop.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected_version: u64,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool>;

    /// Set `key` to `value` only if it does not already exist (`SET NX`).
    /// Used for distributed locks and idempotency tokens.
    async fn set_if_absent(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<bool>;

    async fn del(&self, key: &str) -> Result<()>;

    /// Atomically increment the integer stored at `key` (creating it at 0
    /// first if absent) and return the new value.
    async fn incr(&self, key: &str, by: i64) -> Result<i64>;

    /// Lightweight liveness probe used by health checks.
    async fn health(&self) -> Result<()>;
}
