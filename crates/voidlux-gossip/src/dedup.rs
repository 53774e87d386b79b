//! Bounded cache of already-applied gossip keys.

use parking_lot::Mutex;
use std::collections::HashMap;

/// Default capacity before the cache sheds its older half.
const DEFAULT_CAPACITY: usize = 10_000;

/// Insertion-ordered seen set. When the bound is exceeded, the most
/// recent half is retained; old keys re-arriving after that are rare
/// enough that a second application (idempotent by construction) is
/// acceptable.
#[derive(Debug)]
pub struct SeenCache {
    capacity: usize,
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    seq: u64,
    keys: HashMap<String, u64>,
}

impl SeenCache {
    /// Creates a cache with the default 10k bound.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates a cache with an explicit bound.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(2),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Marks a key seen. Returns true when the key was fresh (the
    /// caller should apply and re-broadcast) and false for a duplicate.
    pub fn insert(&self, key: &str) -> bool {
        let mut inner = self.inner.lock();
        if inner.keys.contains_key(key) {
            return false;
        }
        let seq = inner.seq;
        inner.seq += 1;
        inner.keys.insert(key.to_string(), seq);

        if inner.keys.len() > self.capacity {
            let mut seqs: Vec<u64> = inner.keys.values().copied().collect();
            seqs.sort_unstable();
            let cutoff = seqs[seqs.len() / 2];
            inner.keys.retain(|_, s| *s >= cutoff);
        }
        true
    }

    /// True when the key has been seen (and not yet shed).
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().keys.contains_key(key)
    }

    /// Current number of retained keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().keys.len()
    }

    /// True when nothing has been seen.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().keys.is_empty()
    }
}

impl Default for SeenCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn first_insert_is_fresh_second_is_duplicate() {
        let cache = SeenCache::new();
        assert!(cache.insert("task_create:abc"));
        assert!(!cache.insert("task_create:abc"));
        assert!(cache.contains("task_create:abc"));
    }

    #[test]
    fn overflow_sheds_older_half() {
        let cache = SeenCache::with_capacity(100);
        for i in 0..101 {
            cache.insert(&format!("key:{i}"));
        }
        assert!(cache.len() <= 51);
        // The newest keys survive.
        assert!(cache.contains("key:100"));
        assert!(!cache.contains("key:0"));
    }

    #[test]
    fn shed_keys_count_as_fresh_again() {
        let cache = SeenCache::with_capacity(10);
        for i in 0..11 {
            cache.insert(&format!("key:{i}"));
        }
        assert!(cache.insert("key:0"));
    }

    #[test]
    fn distinct_keys_all_fresh() {
        let cache = SeenCache::new();
        assert!(cache.insert("a"));
        assert!(cache.insert("b"));
        assert!(cache.insert("c"));
        assert_eq!(cache.len(), 3);
    }
}
