//! Redis-backed [`KvStore`].
//!
//! Each key is stored as a hash with `value` and `version` fields so
//! compare-and-swap can be done atomically with a Lua script instead of
//! WATCH/MULTI round-trips.

use std::time::Duration;

use async_trait::async_trait;
use flowforge_core::error::{CoreError, Result};
use flowforge_core::kv::{KvStore, Versioned};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

const CAS_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], 'version')
if current == false then current = '0' end
if current ~= ARGV[1] then
  return 0
end
redis.call('HSET', KEYS[1], 'value', ARGV[2], 'version', ARGV[1] + 1)
if tonumber(ARGV[3]) > 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[3])
end
return 1
"#;

const SET_NX_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 0
end
redis.call('HSET', KEYS[1], 'value', ARGV[1], 'version', 1)
if tonumber(ARGV[2]) > 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 1
"#;

const SET_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], 'version')
if current == false then current = '0' end
redis.call('HSET', KEYS[1], 'value', ARGV[1], 'version', current + 1)
if tonumber(ARGV[2]) > 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return current + 1
"#;

pub struct RedisKvStore {
    conn: ConnectionManager,
}

impl RedisKvStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|e| CoreError::Network(e.to_string()))?;
        let conn = client
            .get_tokio_connection_manager()
            .await
            .map_err(|e| CoreError::Network(e.to_string()))?;
        Ok(Self { conn })
    }

    fn ttl_millis(ttl: Option<Duration>) -> i64 {
        ttl.map(|d| d.as_millis() as i64).unwrap_or(0)
    }
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn
            .hget(key, "value")
            .await
            .map_err(|e| CoreError::Network(e.to_string()))?;
        Ok(value)
    }

    async fn get_versioned(&self, key: &str) -> Result<Option<Versioned<Vec<u8>>>> {
        let mut conn = self.conn.clone();
        let fields: Option<(Vec<u8>, u64)> = conn
            .hget(key, &["value", "version"])
            .await
            .map_err(|e| CoreError::Network(e.to_string()))?;
        Ok(fields.map(|(value, version)| Versioned { value, version }))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = Script::new(SET_SCRIPT)
            .key(key)
            .arg(value)
            .arg(Self::ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| CoreError::Network(e.to_string()))?;
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_version: u64,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let mut conn = self.conn.clone();
        let applied: i64 = Script::new(CAS_SCRIPT)
            .key(key)
            .arg(expected_version)
            .arg(value)
            .arg(Self::ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| CoreError::Network(e.to_string()))?;
        Ok(applied == 1)
    }

    async fn set_if_absent(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<bool> {
        let mut conn = self.conn.clone();
        let applied: i64 = Script::new(SET_NX_SCRIPT)
            .key(key)
            .arg(value)
            .arg(Self::ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| CoreError::Network(e.to_string()))?;
        Ok(applied == 1)
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(key).await.map_err(|e| CoreError::Network(e.to_string()))?;
        Ok(())
    }

    async fn incr(&self, key: &str, by: i64) -> Result<i64> {
        let mut conn = self.conn.clone();
        conn.hincr(key, "counter", by)
            .await
            .map_err(|e| CoreError::Network(e.to_string()))
    }

    async fn health(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| CoreError::Network(e.to_string()))?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(CoreError::Network(format!("unexpected PING reply: {pong}")))
        }
    }
}
