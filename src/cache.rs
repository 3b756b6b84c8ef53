//! Bounded in-process recency cache
//!
//! Each worker keeps one of these in front of the shared registry. It holds
//! backend pools and TLS contexts and can be switched off entirely from the
//! configuration, in which case every lookup misses and inserts are dropped.

use lru::LruCache;
use parking_lot::Mutex;
use std::hash::Hash;
use std::num::NonZeroUsize;

/// Default number of entries kept before the least recently used is evicted
pub const DEFAULT_CAPACITY: usize = 10_000;

/// A capacity-bounded LRU cache with an on/off switch
pub struct BoundedCache<K, V> {
    entries: Mutex<LruCache<K, V>>,
    enabled: bool,
}

impl<K: Hash + Eq, V: Clone> BoundedCache<K, V> {
    /// Create a cache holding at most `capacity` entries (a zero capacity is
    /// treated as one)
    pub fn new(capacity: usize, enabled: bool) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            enabled,
        }
    }

    /// A cache that never stores anything
    pub fn disabled() -> Self {
        Self::new(1, false)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Look up a key, marking it as most recently used
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        if !self.enabled {
            return None;
        }
        self.entries.lock().get(key).cloned()
    }

    /// Insert or replace a value, evicting the least recently used entry on overflow
    pub fn set(&self, key: K, value: V) {
        if !self.enabled {
            return;
        }
        self.entries.lock().put(key, value);
    }

    /// Remove a key. Removing a missing key is a no-op.
    pub fn delete<Q>(&self, key: &Q)
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.lock().pop(key);
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_and_set() {
        let cache: BoundedCache<String, u32> = BoundedCache::new(4, true);
        assert_eq!(cache.get("a"), None);

        cache.set("a".to_string(), 1);
        assert_eq!(cache.get("a"), Some(1));

        cache.set("a".to_string(), 2);
        assert_eq!(cache.get("a"), Some(2));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let cache: BoundedCache<String, u32> = BoundedCache::new(2, true);
        cache.set("a".to_string(), 1);
        cache.set("b".to_string(), 2);

        // Touch "a" so "b" becomes the eviction candidate
        assert_eq!(cache.get("a"), Some(1));
        cache.set("c".to_string(), 3);

        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("c"), Some(3));
    }

    #[test]
    fn test_delete_is_idempotent() {
        let cache: BoundedCache<String, u32> = BoundedCache::new(2, true);
        cache.set("a".to_string(), 1);
        cache.delete("a");
        cache.delete("a");
        cache.delete("never-set");
        assert!(cache.is_empty());
    }

    #[test]
    fn test_disabled_cache_never_stores() {
        let cache: BoundedCache<String, u32> = BoundedCache::disabled();
        assert!(!cache.is_enabled());

        cache.set("a".to_string(), 1);
        assert_eq!(cache.get("a"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_zero_capacity_holds_one_entry() {
        let cache: BoundedCache<String, u32> = BoundedCache::new(0, true);
        cache.set("a".to_string(), 1);
        cache.set("b".to_string(), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("b"), Some(2));
    }
}
