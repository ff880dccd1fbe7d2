//! # Cache-Aside Helper
//!
//! Bounded TTL cache for values that are expensive to produce, such as the
//! link verification walk.
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::cache::{CacheStatus, TtlCache};
//! use std::time::Duration;
//!
//! let cache: TtlCache<&'static str, u64> = TtlCache::new(16);
//! let (value, status) = cache
//!     .get_or_try_insert_with("walk", Duration::from_secs(30), || async {
//!         Ok::<_, std::io::Error>(expensive_walk().await?)
//!     })
//!     .await?;
//! ```
//!
//! The cache lock is never held while the producer runs, so two callers that
//! miss at the same time may both produce; the later write wins.

use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Whether a value came from the cache or was freshly produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
    Hit,
    Miss,
}

impl CacheStatus {
    pub fn is_hit(&self) -> bool {
        matches!(self, CacheStatus::Hit)
    }
}

struct Slot<V> {
    value: V,
    expires_at: Instant,
}

/// LRU-bounded map whose entries expire after a per-insert TTL.
pub struct TtlCache<K, V> {
    entries: Mutex<LruCache<K, Slot<V>>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Hash + Eq,
    V: Clone,
{
    /// Creates a cache holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Returns the live value for `key`, if any. Expired entries are evicted.
    pub async fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(slot) if slot.expires_at > Instant::now() => Some(slot.value.clone()),
            Some(_) => {
                entries.pop(key);
                None
            }
            None => None,
        }
    }

    pub async fn insert(&self, key: K, value: V, ttl: Duration) {
        let slot = Slot {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.entries.lock().await.put(key, slot);
    }

    /// Returns the cached value or runs `producer`, caching its success.
    ///
    /// Producer errors are returned as-is and nothing is cached.
    pub async fn get_or_try_insert_with<F, Fut, E>(
        &self,
        key: K,
        ttl: Duration,
        producer: F,
    ) -> Result<(V, CacheStatus), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(&key).await {
            return Ok((value, CacheStatus::Hit));
        }

        let value = producer().await?;
        self.insert(key, value.clone(), ttl).await;
        Ok((value, CacheStatus::Miss))
    }

    pub async fn invalidate(&self, key: &K) {
        self.entries.lock().await.pop(key);
    }

    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

impl<K, V> std::fmt::Debug for TtlCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlCache").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_miss_then_hit() {
        let cache: TtlCache<&str, u32> = TtlCache::new(4);
        let calls = AtomicUsize::new(0);

        let produce = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(7)
        };

        let (value, status) = cache
            .get_or_try_insert_with("k", Duration::from_secs(60), produce)
            .await
            .unwrap();
        assert_eq!((value, status), (7, CacheStatus::Miss));

        let (value, status) = cache
            .get_or_try_insert_with("k", Duration::from_secs(60), produce)
            .await
            .unwrap();
        assert_eq!((value, status), (7, CacheStatus::Hit));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expired_entry_is_reproduced() {
        let cache: TtlCache<&str, u32> = TtlCache::new(4);
        cache.insert("k", 1, Duration::from_millis(5)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(cache.get(&"k").await, None);
        let (value, status) = cache
            .get_or_try_insert_with("k", Duration::from_secs(60), || async {
                Ok::<_, String>(2)
            })
            .await
            .unwrap();
        assert_eq!(value, 2);
        assert!(!status.is_hit());
    }

    #[tokio::test]
    async fn test_producer_error_not_cached() {
        let cache: TtlCache<&str, u32> = TtlCache::new(4);
        let result = cache
            .get_or_try_insert_with("k", Duration::from_secs(60), || async {
                Err::<u32, _>("walk failed".to_string())
            })
            .await;
        assert_eq!(result, Err("walk failed".to_string()));
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_invalidate_and_capacity() {
        let cache: TtlCache<u32, u32> = TtlCache::new(2);
        cache.insert(1, 10, Duration::from_secs(60)).await;
        cache.insert(2, 20, Duration::from_secs(60)).await;
        cache.insert(3, 30, Duration::from_secs(60)).await;
        assert_eq!(cache.len().await, 2);
        assert_eq!(cache.get(&1).await, None);

        cache.invalidate(&2).await;
        assert_eq!(cache.get(&2).await, None);
        assert_eq!(cache.get(&3).await, Some(30));

        cache.clear().await;
        assert!(cache.is_empty().await);
    }
}
