//! Idempotency ledger: dedup-by-id with a TTL, so redelivered envelopes
//! (spec.md §4.2 at-least-once delivery) are processed at most once.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::error::Result;
use crate::kv::KvStore;

/// Default window an envelope id is remembered for (spec.md §4.2).
pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(24 * 60 * 60);

fn ledger_key(scope: &str, id: Uuid) -> String {
    format!("idempotency:{scope}:{id}")
}

/// Record `id` as seen within `scope`. Returns `true` the first time an id
/// is recorded, `false` on every subsequent (duplicate) call within the TTL.
pub async fn deduplicate(kv: &dyn KvStore, scope: &str, id: Uuid, ttl: Duration) -> Result<bool> {
    kv.set_if_absent(&ledger_key(scope, id), vec![1], Some(ttl)).await
}

/// Run `f` only if `id` has not already run within `scope`'s dedup window.
/// Returns `Ok(None)` if the id was a duplicate and `f` was skipped.
pub async fn once<F, Fut, T, E>(
    kv: Arc<dyn KvStore>,
    scope: &str,
    id: Uuid,
    ttl: Duration,
    f: F,
) -> std::result::Result<Option<T>, E>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, E>>,
    E: From<crate::error::CoreError>,
{
    let first_time = deduplicate(kv.as_ref(), scope, id, ttl).await.map_err(E::from)?;
    if !first_time {
        return Ok(None);
    }
    f().await.map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use crate::kv::Versioned;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemKv {
        store: Mutex<HashMap<String, Vec<u8>>>,
    }

    #[async_trait]
    impl KvStore for MemKv {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            Ok(self.store.lock().unwrap().get(key).cloned())
        }

        async fn get_versioned(&self, _key: &str) -> Result<Option<Versioned<Vec<u8>>>> {
            unimplemented!("not exercised by idempotency tests")
        }

        async fn set(&self, key: &str, value: Vec<u8>, _ttl: Option<Duration>) -> Result<()> {
            self.store.lock().unwrap().insert(key.to_string(), value);
            Ok(())
        }

        async fn compare_and_swap(
            &self,
            _key: &str,
            _expected_version: u64,
            _value: Vec<u8>,
            _ttl: Option<Duration>,
        ) -> Result<bool> {
            unimplemented!("not exercised by idempotency tests")
        }

        async fn set_if_absent(&self, key: &str, value: Vec<u8>, _ttl: Option<Duration>) -> Result<bool> {
            let mut store = self.store.lock().unwrap();
            if store.contains_key(key) {
                return Ok(false);
            }
            store.insert(key.to_string(), value);
            Ok(true)
        }

        async fn del(&self, key: &str) -> Result<()> {
            self.store.lock().unwrap().remove(key);
            Ok(())
        }

        async fn incr(&self, _key: &str, _by: i64) -> Result<i64> {
            unimplemented!("not exercised by idempotency tests")
        }

        async fn health(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn first_delivery_runs_duplicate_is_skipped() {
        let kv: Arc<dyn KvStore> = Arc::new(MemKv::default());
        let id = Uuid::now_v7();

        let first: std::result::Result<Option<u32>, CoreError> =
            once(kv.clone(), "task.result", id, DEFAULT_DEDUP_TTL, || async { Ok(1) }).await;
        assert_eq!(first.unwrap(), Some(1));

        let second: std::result::Result<Option<u32>, CoreError> =
            once(kv.clone(), "task.result", id, DEFAULT_DEDUP_TTL, || async { Ok(2) }).await;
        assert_eq!(second.unwrap(), None);
    }

    #[tokio::test]
    async fn different_scopes_do_not_collide() {
        let kv: Arc<dyn KvStore> = Arc::new(MemKv::default());
        let id = Uuid::now_v7();

        assert!(deduplicate(kv.as_ref(), "scope-a", id, DEFAULT_DEDUP_TTL).await.unwrap());
        assert!(deduplicate(kv.as_ref(), "scope-b", id, DEFAULT_DEDUP_TTL).await.unwrap());
    }
}
