//! In-memory [`KvStore`], used for local development and tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use flowforge_core::error::Result;
use flowforge_core::kv::{KvStore, Versioned};

struct Entry {
    value: Vec<u8>,
    version: u64,
    expires_at: Option<Instant>,
}

#[derive(Default)]
pub struct InMemoryKvStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn live(entry: &Entry) -> bool {
        match entry.expires_at {
            Some(at) => Instant::now() < at,
            None => true,
        }
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let entries = self.entries.lock().unwrap();
        Ok(entries
            .get(key)
            .filter(|e| Self::live(e))
            .map(|e| e.value.clone()))
    }

    async fn get_versioned(&self, key: &str) -> Result<Option<Versioned<Vec<u8>>>> {
        let entries = self.entries.lock().unwrap();
        Ok(entries.get(key).filter(|e| Self::live(e)).map(|e| Versioned {
            value: e.value.clone(),
            version: e.version,
        }))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        let version = entries.get(key).map(|e| e.version + 1).unwrap_or(1);
        entries.insert(
            key.to_string(),
            Entry {
                value,
                version,
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_version: u64,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let mut entries = self.entries.lock().unwrap();
        let current_version = entries
            .get(key)
            .filter(|e| Self::live(e))
            .map(|e| e.version)
            .unwrap_or(0);
        if current_version != expected_version {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value,
                version: current_version + 1,
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(true)
    }

    async fn set_if_absent(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<bool> {
        let mut entries = self.entries.lock().unwrap();
        if entries.get(key).filter(|e| Self::live(e)).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value,
                version: 1,
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    async fn incr(&self, key: &str, by: i64) -> Result<i64> {
        let mut entries = self.entries.lock().unwrap();
        let current: i64 = entries
            .get(key)
            .filter(|e| Self::live(e))
            .map(|e| String::from_utf8_lossy(&e.value).parse().unwrap_or(0))
            .unwrap_or(0);
        let next = current + by;
        let version = entries.get(key).map(|e| e.version + 1).unwrap_or(1);
        entries.insert(
            key.to_string(),
            Entry {
                value: next.to_string().into_bytes(),
                version,
                expires_at: None,
            },
        );
        Ok(next)
    }

    async fn health(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let kv = InMemoryKvStore::new();
        kv.set("k", b"v".to_vec(), None).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn ttl_expires_entries() {
        let kv = InMemoryKvStore::new();
        kv.set("k", b"v".to_vec(), Some(Duration::from_millis(5)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn cas_fails_on_version_mismatch() {
        let kv = InMemoryKvStore::new();
        kv.set("k", b"v1".to_vec(), None).await.unwrap();
        assert!(!kv.compare_and_swap("k", 99, b"v2".to_vec(), None).await.unwrap());
        assert!(kv.compare_and_swap("k", 1, b"v2".to_vec(), None).await.unwrap());
        assert_eq!(kv.get("k").await.unwrap(), Some(b"v2".to_vec()));
    }

    #[tokio::test]
    async fn set_if_absent_only_succeeds_once() {
        let kv = InMemoryKvStore::new();
        assert!(kv.set_if_absent("lock", b"1".to_vec(), None).await.unwrap());
        assert!(!kv.set_if_absent("lock", b"1".to_vec(), None).await.unwrap());
    }

    #[tokio::test]
    async fn incr_creates_and_accumulates() {
        let kv = InMemoryKvStore::new();
        assert_eq!(kv.incr("counter", 1).await.unwrap(), 1);
        assert_eq!(kv.incr("counter", 4).await.unwrap(), 5);
    }
}
