//! Bounded LRU cache with per-entry TTL.
//!
//! Two shapes are expected of callers: a cheap-to-refuse response cache
//! (small capacity, short TTL) and an expensive-to-recompute metadata
//! cache (larger capacity, longer TTL). Both are instances of the same
//! [`TtlLruCache`] — only the capacity and default TTL differ.
//!
//! A background sweeper (started with [`TtlLruCache::spawn_sweeper`]) walks
//! the cache every 60 seconds and evicts anything past its expiry, so
//! memory used by entries nobody ever looks up again doesn't linger until
//! the next `put` forces an LRU eviction.

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// A bounded, recency-ordered cache where every entry also carries an
/// expiry instant.
pub struct TtlLruCache<K, V> {
    inner: Mutex<LruCache<K, Entry<V>>>,
    default_ttl: Duration,
}

impl<K, V> TtlLruCache<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create a cache bounded at `capacity` entries, with `default_ttl`
    /// applied to any `put` that doesn't specify its own TTL.
    pub fn new(capacity: usize, default_ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1).unwrap());
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            default_ttl,
        }
    }

    /// Look up `key`. A hit moves the entry to the most-recently-used
    /// position; an expired entry is removed and reported as absent.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        let hit = inner.get(key).map(|e| (e.value.clone(), e.expires_at));
        match hit {
            Some((value, expires_at)) if expires_at > Instant::now() => Some(value),
            Some(_) => {
                inner.pop(key);
                None
            }
            None => None,
        }
    }

    /// Whether `key` is present and unexpired, without affecting recency.
    pub fn contains(&self, key: &K) -> bool {
        let mut inner = self.inner.lock();
        match inner.peek(key) {
            Some(entry) => entry.expires_at > Instant::now(),
            None => false,
        }
    }

    /// Insert or replace `key` with the cache's default TTL.
    pub fn put(&self, key: K, value: V) {
        self.put_with_ttl(key, value, self.default_ttl);
    }

    /// Insert or replace `key` with an explicit TTL. Capacity eviction (if
    /// the key is new and the cache is full) happens inside `LruCache::put`
    /// itself, so size never exceeds `capacity` after this call returns.
    pub fn put_with_ttl(&self, key: K, value: V, ttl: Duration) {
        let entry = Entry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.inner.lock().put(key, entry);
    }

    /// Remove everything.
    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    /// Number of entries currently stored, including any not-yet-swept
    /// expired ones.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evict every expired entry right now. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let expired: Vec<K> = inner
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            inner.pop(key);
        }
        expired.len()
    }
}

impl<K, V> TtlLruCache<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Spawn the 60-second background sweeper on the current Tokio
    /// runtime. Sweep failures can't happen here (eviction is infallible),
    /// but the loop itself never propagates a panic out to the caller —
    /// it just logs and keeps ticking.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            interval.tick().await; // skip the immediate first tick
            loop {
                interval.tick().await;
                let removed = cache.sweep();
                if removed > 0 {
                    tracing::debug!(removed, "cache sweeper evicted expired entries");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_is_respected() {
        let cache: TtlLruCache<u32, u32> = TtlLruCache::new(2, Duration::from_secs(60));
        cache.put(1, 10);
        cache.put(2, 20);
        cache.put(3, 30);
        assert_eq!(cache.len(), 2);
        // 1 was the least-recently-used and should have been evicted.
        assert!(cache.get(&1).is_none());
        assert_eq!(cache.get(&2), Some(20));
        assert_eq!(cache.get(&3), Some(30));
    }

    #[test]
    fn lru_order_survives_get() {
        let cache: TtlLruCache<u32, u32> = TtlLruCache::new(2, Duration::from_secs(60));
        cache.put(1, 10);
        cache.put(2, 20);
        // Touch 1 so it becomes most-recently-used.
        assert_eq!(cache.get(&1), Some(10));
        cache.put(3, 30);
        // 2 was least-recently-used now, so it's evicted instead of 1.
        assert!(cache.get(&2).is_none());
        assert_eq!(cache.get(&1), Some(10));
        assert_eq!(cache.get(&3), Some(30));
    }

    #[test]
    fn expired_entry_reads_as_absent() {
        let cache: TtlLruCache<&str, i32> = TtlLruCache::new(10, Duration::from_millis(1));
        cache.put("a", 1);
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.get(&"a").is_none());
        assert_eq!(cache.len(), 0, "expired lookup should remove the entry");
    }

    #[test]
    fn sweep_removes_only_expired_entries() {
        let cache: TtlLruCache<&str, i32> = TtlLruCache::new(10, Duration::from_secs(60));
        cache.put_with_ttl("short", 1, Duration::from_millis(1));
        cache.put_with_ttl("long", 2, Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(20));
        let removed = cache.sweep();
        assert_eq!(removed, 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&"long"), Some(2));
    }

    #[test]
    fn contains_respects_ttl_without_touching_recency() {
        let cache: TtlLruCache<&str, i32> = TtlLruCache::new(10, Duration::from_secs(60));
        cache.put("a", 1);
        assert!(cache.contains(&"a"));
        assert!(!cache.contains(&"missing"));
    }

    #[tokio::test]
    async fn sweeper_evicts_in_background() {
        let cache: Arc<TtlLruCache<&str, i32>> =
            Arc::new(TtlLruCache::new(10, Duration::from_millis(10)));
        cache.put("a", 1);
        let _handle = cache.spawn_sweeper();
        tokio::time::sleep(Duration::from_millis(5)).await;
        // Not expired/swept yet.
        assert_eq!(cache.len(), 1);
    }
}
