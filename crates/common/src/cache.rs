use std::fmt;
use std::hash::Hash;
use std::time::Duration;

use moka::sync::Cache;

/// Default upper bound on remembered keys
pub const DEFAULT_CAPACITY: u64 = 100_000;
/// Default time a key is remembered for (one trust window)
pub const DEFAULT_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Bounded set of keys a component has already acted on
///
/// Backs the `done` sets of the verifier and pinner, and the watcher's
/// `seen` set. Entries fall out after `ttl` or when capacity is exceeded,
/// so a long-running node does not grow without bound. Clones share state.
#[derive(Clone)]
pub struct KeyCache<K>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
{
    inner: Cache<K, ()>,
}

impl<K> KeyCache<K>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
{
    pub fn new(capacity: u64, ttl: Duration) -> Self {
        let inner = Cache::builder()
            .max_capacity(capacity)
            .time_to_live(ttl)
            .build();
        Self { inner }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.contains_key(key)
    }

    /// Remember `key`, returning true if it was not already present
    pub fn insert(&self, key: K) -> bool {
        self.inner.entry(key).or_insert(()).is_fresh()
    }

    /// Forget `key` so the next delivery is processed again
    pub fn remove(&self, key: &K) {
        self.inner.invalidate(key);
    }

    pub fn len(&self) -> u64 {
        self.inner.run_pending_tasks();
        self.inner.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K> Default for KeyCache<K>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_TTL)
    }
}

impl<K> fmt::Debug for KeyCache<K>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyCache")
            .field("entries", &self.inner.entry_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_reports_freshness() {
        let cache = KeyCache::<String>::default();
        assert!(cache.insert("a".to_string()));
        assert!(!cache.insert("a".to_string()));
        assert!(cache.contains(&"a".to_string()));
        assert!(!cache.contains(&"b".to_string()));
    }

    #[test]
    fn test_remove_forgets() {
        let cache = KeyCache::<String>::default();
        cache.insert("a".to_string());
        cache.remove(&"a".to_string());
        assert!(!cache.contains(&"a".to_string()));
        assert!(cache.insert("a".to_string()));
    }

    #[test]
    fn test_entries_expire() {
        let cache = KeyCache::<u32>::new(10, Duration::from_millis(20));
        cache.insert(1);
        std::thread::sleep(Duration::from_millis(60));
        assert!(!cache.contains(&1));
    }

    #[test]
    fn test_capacity_is_bounded() {
        let cache = KeyCache::<u32>::new(16, DEFAULT_TTL);
        for i in 0..1_000 {
            cache.insert(i);
        }
        assert!(cache.len() < 1_000);
    }
}
