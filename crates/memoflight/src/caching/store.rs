use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// A value stored in the cache, together with its expiry and recency tick.
#[derive(Debug)]
struct StoreEntry<V> {
    value: V,
    expires_at: Instant,
    /// The recency tick under which this entry is registered in the LRU
    /// index. Updated on every hit.
    tick: u64,
}

#[derive(Debug)]
struct StoreInner<K, V> {
    entries: HashMap<K, StoreEntry<V>>,
    /// Recency index, tick → key. The smallest tick is the least-recently
    /// used entry. Every entry owns exactly one tick in here.
    recency: BTreeMap<u64, K>,
    next_tick: u64,
}

/// A bounded, TTL-aware in-memory map from keys to computed values.
///
/// Expired entries are purged lazily on lookup, eviction is strict LRU and
/// happens when an insert would exceed the configured capacity. All access
/// goes through a single mutex; none of the operations block beyond that.
pub struct CacheStore<K, V> {
    inner: Mutex<StoreInner<K, V>>,
    max_size: usize,
}

impl<K, V> fmt::Debug for CacheStore<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self.inner.lock().unwrap().entries.len();
        f.debug_struct("CacheStore")
            .field("entries", &len)
            .field("max_size", &self.max_size)
            .finish()
    }
}

impl<K, V> CacheStore<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug,
    V: Clone,
{
    /// Creates an empty store holding at most `max_size` entries.
    pub fn new(max_size: usize) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                entries: HashMap::new(),
                recency: BTreeMap::new(),
                next_tick: 0,
            }),
            max_size: max_size.max(1),
        }
    }

    /// Looks up a fresh entry for `key`, marking it as recently used.
    ///
    /// An entry whose TTL has passed is removed and reported as a miss.
    pub fn lookup(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock().unwrap();

        let Some(entry) = inner.entries.get(key) else {
            metric!(counter("cache.miss") += 1);
            return None;
        };

        if Instant::now() >= entry.expires_at {
            let tick = entry.tick;
            inner.entries.remove(key);
            inner.recency.remove(&tick);
            tracing::trace!(?key, "Purging expired cache entry");
            metric!(counter("cache.miss") += 1);
            return None;
        }

        let new_tick = inner.next_tick;
        inner.next_tick += 1;

        let entry = inner.entries.get_mut(key).unwrap();
        let old_tick = std::mem::replace(&mut entry.tick, new_tick);
        let value = entry.value.clone();

        inner.recency.remove(&old_tick);
        inner.recency.insert(new_tick, key.clone());

        metric!(counter("cache.hit") += 1);
        Some(value)
    }

    /// Inserts `value` under `key` with the given time-to-live.
    ///
    /// Overwrites an existing entry in place. If the store is full and `key`
    /// is new, the least-recently-used entry is evicted first.
    pub fn insert(&self, key: K, value: V, ttl: Duration) {
        let mut inner = self.inner.lock().unwrap();

        let tick = inner.next_tick;
        inner.next_tick += 1;

        if let Some(old) = inner.entries.remove(&key) {
            inner.recency.remove(&old.tick);
        } else if inner.entries.len() >= self.max_size {
            // The recency index is kept exact, so the first entry is the
            // least-recently-used one.
            if let Some((&lru_tick, _)) = inner.recency.iter().next() {
                let lru_key = inner.recency.remove(&lru_tick).unwrap();
                inner.entries.remove(&lru_key);
                tracing::debug!(key = ?lru_key, "Evicting least-recently-used cache entry");
                metric!(counter("cache.eviction") += 1);
            }
        }

        let expires_at = Instant::now() + ttl;
        inner.entries.insert(
            key.clone(),
            StoreEntry {
                value,
                expires_at,
                tick,
            },
        );
        inner.recency.insert(tick, key);

        metric!(gauge("cache.size") = inner.entries.len() as u64);
    }

    /// Removes the entry for `key` immediately, regardless of its TTL.
    pub fn invalidate(&self, key: &K) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.entries.remove(key) {
            inner.recency.remove(&entry.tick);
        }
    }

    /// The number of entries currently in the store, expired ones included.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    /// Returns `true` if the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use tokio::time;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let store = CacheStore::new(16);
        store.insert("key", "value", Duration::from_millis(100));

        time::advance(Duration::from_millis(99)).await;
        assert_eq!(store.lookup(&"key"), Some("value"));

        time::advance(Duration::from_millis(1)).await;
        assert_eq!(store.lookup(&"key"), None);
        // The expired entry was purged, not just hidden.
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lru_eviction() {
        let store = CacheStore::new(2);
        let ttl = Duration::from_secs(60);

        store.insert("a", 1, ttl);
        store.insert("b", 2, ttl);

        // Touching "a" makes "b" the least-recently-used entry.
        assert_eq!(store.lookup(&"a"), Some(1));

        store.insert("c", 3, ttl);

        assert_eq!(store.len(), 2);
        assert_eq!(store.lookup(&"a"), Some(1));
        assert_eq!(store.lookup(&"b"), None);
        assert_eq!(store.lookup(&"c"), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overwrite_does_not_evict() {
        let store = CacheStore::new(2);
        let ttl = Duration::from_secs(60);

        store.insert("a", 1, ttl);
        store.insert("b", 2, ttl);
        store.insert("a", 10, ttl);

        assert_eq!(store.len(), 2);
        assert_eq!(store.lookup(&"a"), Some(10));
        assert_eq!(store.lookup(&"b"), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate() {
        let store = CacheStore::new(16);
        store.insert("key", "value", Duration::from_secs(60));

        store.invalidate(&"key");
        assert_eq!(store.lookup(&"key"), None);

        // Invalidating a missing key is a no-op.
        store.invalidate(&"key");
    }
}
