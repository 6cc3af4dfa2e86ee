//! Redis-backed [`KvStore`] (spec.md §4.A's L2 tier) plus an in-memory
//! stand-in for tests and single-node deployments without Redis.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use wagerbridge_core::error::{CoreError, CoreResult};
use wagerbridge_core::KvStore;

#[derive(Clone)]
pub struct RedisKvStore {
    conn: ConnectionManager,
}

impl RedisKvStore {
    pub async fn connect(url: &str) -> CoreResult<Self> {
        let client = redis::Client::open(url).map_err(|err| CoreError::Cache(err.to_string()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|err| CoreError::Cache(err.to_string()))?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn get(&self, key: &str) -> CoreResult<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(|err| CoreError::Cache(err.to_string()))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> CoreResult<()> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(ttl) => conn
                .set_ex::<_, _, ()>(key, value, ttl.as_secs())
                .await
                .map_err(|err| CoreError::Cache(err.to_string())),
            None => conn
                .set::<_, _, ()>(key, value)
                .await
                .map_err(|err| CoreError::Cache(err.to_string())),
        }
    }

    async fn del(&self, key: &str) -> CoreResult<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await.map_err(|err| CoreError::Cache(err.to_string()))
    }

    async fn set_nx_ex(&self, key: &str, value: &[u8], ttl: Duration) -> CoreResult<bool> {
        let mut conn = self.conn.clone();
        let opts = redis::SetOptions::default()
            .conditional_set(redis::ExistenceCheck::NX)
            .with_expiration(redis::SetExpiry::EX(ttl.as_secs() as usize));
        let result: Option<String> = conn
            .set_options(key, value, opts)
            .await
            .map_err(|err| CoreError::Cache(err.to_string()))?;
        Ok(result.is_some())
    }

    async fn compare_delete(&self, key: &str, expected: &[u8]) -> CoreResult<bool> {
        // Lua script keeps the read-compare-delete atomic across the
        // single round-trip Redis requires for correctness under races.
        const SCRIPT: &str = r#"
            if redis.call("GET", KEYS[1]) == ARGV[1] then
                return redis.call("DEL", KEYS[1])
            else
                return 0
            end
        "#;
        let mut conn = self.conn.clone();
        let deleted: i64 = redis::Script::new(SCRIPT)
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(|err| CoreError::Cache(err.to_string()))?;
        Ok(deleted == 1)
    }

    async fn incr(&self, key: &str) -> CoreResult<i64> {
        let mut conn = self.conn.clone();
        conn.incr(key, 1).await.map_err(|err| CoreError::Cache(err.to_string()))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CoreResult<()> {
        let mut conn = self.conn.clone();
        conn.expire::<_, ()>(key, ttl.as_secs() as i64)
            .await
            .map_err(|err| CoreError::Cache(err.to_string()))
    }

    async fn sadd(&self, key: &str, member: &str) -> CoreResult<()> {
        let mut conn = self.conn.clone();
        conn.sadd::<_, _, ()>(key, member)
            .await
            .map_err(|err| CoreError::Cache(err.to_string()))
    }

    async fn smembers(&self, key: &str) -> CoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        conn.smembers(key).await.map_err(|err| CoreError::Cache(err.to_string()))
    }
}

/// In-memory [`KvStore`] for tests and for running the service without a
/// Redis dependency; correctness within a single process only.
#[derive(Default)]
pub struct InMemoryKvStore {
    values: Mutex<HashMap<String, Vec<u8>>>,
    counters: Mutex<HashMap<String, i64>>,
    sets: Mutex<HashMap<String, Vec<String>>>,
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> CoreResult<Option<Vec<u8>>> {
        Ok(self.values.lock().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &[u8], _ttl: Option<Duration>) -> CoreResult<()> {
        self.values.lock().unwrap().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn del(&self, key: &str) -> CoreResult<()> {
        self.values.lock().unwrap().remove(key);
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &[u8], _ttl: Duration) -> CoreResult<bool> {
        let mut values = self.values.lock().unwrap();
        if values.contains_key(key) {
            Ok(false)
        } else {
            values.insert(key.to_string(), value.to_vec());
            Ok(true)
        }
    }

    async fn compare_delete(&self, key: &str, expected: &[u8]) -> CoreResult<bool> {
        let mut values = self.values.lock().unwrap();
        if values.get(key).map(|v| v.as_slice()) == Some(expected) {
            values.remove(key);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn incr(&self, key: &str) -> CoreResult<i64> {
        let mut counters = self.counters.lock().unwrap();
        let entry = counters.entry(key.to_string()).or_insert(0);
        *entry += 1;
        Ok(*entry)
    }

    async fn expire(&self, _key: &str, _ttl: Duration) -> CoreResult<()> {
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str) -> CoreResult<()> {
        self.sets
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .push(member.to_string());
        Ok(())
    }

    async fn smembers(&self, key: &str) -> CoreResult<Vec<String>> {
        Ok(self.sets.lock().unwrap().get(key).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_store_supports_nx_semantics() {
        let store = InMemoryKvStore::default();
        assert!(store.set_nx_ex("k", b"1", Duration::from_secs(1)).await.unwrap());
        assert!(!store.set_nx_ex("k", b"2", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn in_memory_compare_delete_only_matches_expected_value() {
        let store = InMemoryKvStore::default();
        store.set("k", b"token-a", None).await.unwrap();
        assert!(!store.compare_delete("k", b"token-b").await.unwrap());
        assert!(store.compare_delete("k", b"token-a").await.unwrap());
    }
}
