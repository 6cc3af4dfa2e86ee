//! Two-tier cache (spec.md §4.A): L1 bounded in-process map with LRU
//! eviction and per-entry TTL, L2 a shared KV store behind the [`KvStore`]
//! trait. Reads try L1 then L2, repopulating L1 on an L2 hit with
//! `ttl = min(l2_ttl, 60s)`. On L2 unavailability every call degrades to
//! the caller-supplied fallback rather than failing (Design note 4:
//! "Decorator-based caching → explicit cache interface").

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::error::CoreResult;

const L1_MAX_TTL: Duration = Duration::from_secs(60);

/// Shared key-value store (L2). Implementations: Redis in
/// `wagerbridge-adapters::kv::RedisKvStore`, in-memory for tests.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> CoreResult<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> CoreResult<()>;
    async fn del(&self, key: &str) -> CoreResult<()>;
    /// `SET key value NX EX ttl` — returns true iff the key did not
    /// already exist (used by the distributed lock and the nonce store).
    async fn set_nx_ex(&self, key: &str, value: &[u8], ttl: Duration) -> CoreResult<bool>;
    /// Compare-and-delete: deletes `key` iff its current value equals
    /// `expected`. Used to release a distributed lock only by its holder.
    async fn compare_delete(&self, key: &str, expected: &[u8]) -> CoreResult<bool>;
    /// Atomic increment, returning the post-increment value.
    async fn incr(&self, key: &str) -> CoreResult<i64>;
    async fn expire(&self, key: &str, ttl: Duration) -> CoreResult<()>;
    async fn sadd(&self, key: &str, member: &str) -> CoreResult<()>;
    async fn smembers(&self, key: &str) -> CoreResult<Vec<String>>;
}

struct L1Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

/// Bounded in-process map with approximate LRU eviction.
struct L1Cache {
    capacity: usize,
    entries: HashMap<String, L1Entry>,
    order: VecDeque<String>,
}

impl L1Cache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&mut self, key: &str) -> Option<Vec<u8>> {
        let now = Instant::now();
        let hit = match self.entries.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.value.clone()),
            Some(_) => None,
            None => return None,
        };
        if hit.is_some() {
            self.touch(key);
        } else {
            self.entries.remove(key);
        }
        hit
    }

    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        self.order.push_back(key.to_string());
    }

    fn set(&mut self, key: String, value: Vec<u8>, ttl: Duration) {
        if !self.entries.contains_key(&key) {
            while self.entries.len() >= self.capacity {
                if let Some(oldest) = self.order.pop_front() {
                    self.entries.remove(&oldest);
                } else {
                    break;
                }
            }
        }
        self.entries.insert(
            key.clone(),
            L1Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        self.touch(&key);
    }

    fn remove(&mut self, key: &str) {
        self.entries.remove(key);
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
    }
}

/// Result of a cache-or-compute read, signalling whether the read
/// degraded to the fallback computation because L2 was unavailable.
#[derive(Debug, Clone)]
pub struct Cached<T> {
    pub value: T,
    pub degraded: bool,
}

pub struct CacheLayer {
    l1: Mutex<L1Cache>,
    l2: Box<dyn KvStore>,
}

impl CacheLayer {
    pub fn new(l2: Box<dyn KvStore>, l1_capacity: usize) -> Self {
        Self {
            l1: Mutex::new(L1Cache::new(l1_capacity)),
            l2,
        }
    }

    /// `cache.get_or_compute(key, tags, ttl, fn)` — Design note 4's explicit
    /// call-site cache, replacing decorator/wrapper caching.
    pub async fn get_or_compute<T, F, Fut>(
        &self,
        key: &str,
        tags: &[String],
        ttl: Duration,
        compute: F,
    ) -> CoreResult<Cached<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = CoreResult<T>>,
    {
        if let Some(bytes) = self.l1.lock().unwrap().get(key) {
            if let Ok(value) = serde_json::from_slice(&bytes) {
                return Ok(Cached {
                    value,
                    degraded: false,
                });
            }
        }

        match self.l2.get(key).await {
            Ok(Some(bytes)) => {
                self.l1
                    .lock()
                    .unwrap()
                    .set(key.to_string(), bytes.clone(), L1_MAX_TTL.min(ttl));
                let value = serde_json::from_slice(&bytes)?;
                Ok(Cached {
                    value,
                    degraded: false,
                })
            }
            Ok(None) => {
                let value = compute().await?;
                self.set_with_tags(key, &value, tags, ttl).await.ok();
                Ok(Cached {
                    value,
                    degraded: false,
                })
            }
            Err(err) => {
                warn!(error = %err, key, "L2 cache unavailable, degrading to fallback");
                let value = compute().await?;
                Ok(Cached {
                    value,
                    degraded: true,
                })
            }
        }
    }

    pub async fn set_with_tags<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        tags: &[String],
        ttl: Duration,
    ) -> CoreResult<()> {
        let bytes = serde_json::to_vec(value)?;
        self.l1
            .lock()
            .unwrap()
            .set(key.to_string(), bytes.clone(), L1_MAX_TTL.min(ttl));
        if let Err(err) = self.l2.set(key, &bytes, Some(ttl)).await {
            warn!(error = %err, key, "L2 cache write failed, continuing in degraded mode");
            return Ok(());
        }
        for tag in tags {
            let tag_key = format!("tag:{tag}");
            if let Err(err) = self.l2.sadd(&tag_key, key).await {
                warn!(error = %err, tag, "failed to register cache key under tag");
            }
        }
        Ok(())
    }

    /// Invalidate every key registered under `tag`. Best-effort: a failure
    /// is logged but never surfaced, since callers must tolerate brief
    /// staleness (spec.md §4.A).
    pub async fn invalidate_by_tag(&self, tag: &str) {
        let tag_key = format!("tag:{tag}");
        let members = match self.l2.smembers(&tag_key).await {
            Ok(members) => members,
            Err(err) => {
                warn!(error = %err, tag, "failed to read tag members for invalidation");
                return;
            }
        };
        {
            let mut l1 = self.l1.lock().unwrap();
            for key in &members {
                l1.remove(key);
            }
        }
        for key in &members {
            if let Err(err) = self.l2.del(key).await {
                warn!(error = %err, key, "failed to invalidate cache key");
            }
        }
        if let Err(err) = self.l2.del(&tag_key).await {
            warn!(error = %err, tag, "failed to delete tag set");
        }
    }

    pub async fn remove(&self, key: &str) {
        self.l1.lock().unwrap().remove(key);
        if let Err(err) = self.l2.del(key).await {
            warn!(error = %err, key, "failed to delete cache key");
        }
    }

    /// `check_and_store_nonce` — `SET nonce:<n> 1 NX EX 600`; returns true
    /// iff the nonce had not already been seen (spec.md §4.A, used by
    /// §4.E's callback replay protection).
    pub async fn check_and_store_nonce(&self, nonce: &str, ttl: Duration) -> CoreResult<bool> {
        let key = format!("nonce:{nonce}");
        self.l2.set_nx_ex(&key, b"1", ttl).await
    }

    /// Acquire a distributed lock, returning a fencing token on success.
    pub async fn lock(&self, name: &str, ttl: Duration) -> CoreResult<Option<String>> {
        let key = format!("lock:{name}");
        let token = uuid::Uuid::new_v4().to_string();
        let acquired = self.l2.set_nx_ex(&key, token.as_bytes(), ttl).await?;
        Ok(acquired.then_some(token))
    }

    pub async fn unlock(&self, name: &str, token: &str) -> CoreResult<bool> {
        let key = format!("lock:{name}");
        self.l2.compare_delete(&key, token.as_bytes()).await
    }

    /// Atomic increment with expiry-on-first-increment, used by the
    /// admission pipeline's fixed-window rate limiter (spec.md §4.C).
    pub async fn incr_with_window(&self, key: &str, window: Duration) -> CoreResult<i64> {
        let count = self.l2.incr(key).await?;
        if count == 1 {
            self.l2.expire(key, window).await?;
        }
        Ok(count)
    }

    pub async fn get_raw(&self, key: &str) -> CoreResult<Option<Vec<u8>>> {
        self.l2.get(key).await
    }

    pub async fn set_raw(&self, key: &str, value: &[u8], ttl: Duration) -> CoreResult<()> {
        self.l2.set(key, value, Some(ttl)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct InMemoryKv {
        map: StdMutex<HashMap<String, Vec<u8>>>,
        counters: StdMutex<HashMap<String, i64>>,
        sets: StdMutex<HashMap<String, Vec<String>>>,
    }

    #[async_trait]
    impl KvStore for InMemoryKv {
        async fn get(&self, key: &str) -> CoreResult<Option<Vec<u8>>> {
            Ok(self.map.lock().unwrap().get(key).cloned())
        }
        async fn set(&self, key: &str, value: &[u8], _ttl: Option<Duration>) -> CoreResult<()> {
            self.map
                .lock()
                .unwrap()
                .insert(key.to_string(), value.to_vec());
            Ok(())
        }
        async fn del(&self, key: &str) -> CoreResult<()> {
            self.map.lock().unwrap().remove(key);
            Ok(())
        }
        async fn set_nx_ex(&self, key: &str, value: &[u8], _ttl: Duration) -> CoreResult<bool> {
            let mut map = self.map.lock().unwrap();
            if map.contains_key(key) {
                Ok(false)
            } else {
                map.insert(key.to_string(), value.to_vec());
                Ok(true)
            }
        }
        async fn compare_delete(&self, key: &str, expected: &[u8]) -> CoreResult<bool> {
            let mut map = self.map.lock().unwrap();
            if map.get(key).map(|v| v.as_slice()) == Some(expected) {
                map.remove(key);
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

    #[tokio::test]
    async fn nonce_is_single_use() {
        let cache = CacheLayer::new(Box::new(InMemoryKv::default()), 100);
        assert!(cache
            .check_and_store_nonce("n1", Duration::from_secs(600))
            .await
            .unwrap());
        assert!(!cache
            .check_and_store_nonce("n1", Duration::from_secs(600))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn lock_unlock_roundtrip() {
        let cache = CacheLayer::new(Box::new(InMemoryKv::default()), 100);
        let token = cache
            .lock("report:1", Duration::from_secs(30))
            .await
            .unwrap()
            .expect("lock acquired");
        assert!(cache
            .lock("report:1", Duration::from_secs(30))
            .await
            .unwrap()
            .is_none());
        assert!(cache.unlock("report:1", &token).await.unwrap());
        assert!(cache
            .lock("report:1", Duration::from_secs(30))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn get_or_compute_caches_across_l1_and_l2() {
        let cache = CacheLayer::new(Box::new(InMemoryKv::default()), 100);
        let mut calls = 0;
        let first = cache
            .get_or_compute("k", &[], Duration::from_secs(30), || async {
                calls += 1;
                Ok(42)
            })
            .await
            .unwrap();
        assert_eq!(first.value, 42);
        let second: Cached<i32> = cache
            .get_or_compute("k", &[], Duration::from_secs(30), || async {
                unreachable!("should hit L1")
            })
            .await
            .unwrap();
        assert_eq!(second.value, 42);
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn tag_invalidation_removes_all_tagged_keys() {
        let cache = CacheLayer::new(Box::new(InMemoryKv::default()), 100);
        cache
            .set_with_tags("a", &1, &["wallet:1".to_string()], Duration::from_secs(30))
            .await
            .unwrap();
        cache
            .set_with_tags("b", &2, &["wallet:1".to_string()], Duration::from_secs(30))
            .await
            .unwrap();
        cache.invalidate_by_tag("wallet:1").await;
        assert!(cache.get_raw("a").await.unwrap().is_none());
        assert!(cache.get_raw("b").await.unwrap().is_none());
    }
}
