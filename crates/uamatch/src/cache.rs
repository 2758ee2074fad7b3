//! Two-generation record cache
//!
//! Memoises hot records for the heavy lists (strings, values, profiles,
//! signatures, nodes). The cache keeps two generations, `active` and
//! `background`. A lookup hits `active` directly, or promotes from
//! `background` into `active`. When `active` fills, the generations switch:
//! `background` is discarded, `active` becomes the new `background`, and a
//! fresh `active` starts collecting. The effect approximates LRU with
//! constant-time operations and no per-entry bookkeeping.
//!
//! Values are handed out as `Arc` clones so entries stay cheap to share
//! between the cache and callers.

use rustc_hash::FxHashMap;
use std::hash::Hash;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Point-in-time counters of one cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Total lookups
    pub requests: u64,
    /// Lookups that had to fetch from the underlying list
    pub misses: u64,
    /// Generation switches
    pub switches: u64,
}

struct Generations<K, V> {
    active: FxHashMap<K, Arc<V>>,
    background: FxHashMap<K, Arc<V>>,
}

/// Two-generation cache keyed by record index or offset
pub struct TwoGenerationCache<K, V> {
    capacity: usize,
    generations: Mutex<Generations<K, V>>,
    requests: AtomicU64,
    misses: AtomicU64,
    switches: AtomicU64,
}

impl<K: Eq + Hash, V> TwoGenerationCache<K, V> {
    /// Create a cache that switches generations every `capacity` inserts
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            generations: Mutex::new(Generations {
                active: FxHashMap::default(),
                background: FxHashMap::default(),
            }),
            requests: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            switches: AtomicU64::new(0),
        }
    }

    /// Look up `key`, filling from `fetch` on a miss
    ///
    /// The fetch runs outside the cache lock; a fetch error propagates to
    /// the caller and leaves the cache unchanged, so the underlying list
    /// remains the source of truth.
    pub fn get_or_try_insert_with<E>(
        &self,
        key: K,
        fetch: impl FnOnce() -> Result<V, E>,
    ) -> Result<Arc<V>, E>
    where
        K: Clone,
    {
        self.requests.fetch_add(1, Ordering::Relaxed);
        {
            let mut generations = self
                .generations
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(value) = generations.active.get(&key) {
                return Ok(Arc::clone(value));
            }
            if let Some(value) = generations.background.remove(&key) {
                let promoted = Arc::clone(&value);
                self.insert_active(&mut generations, key, value);
                return Ok(promoted);
            }
        }

        let value = Arc::new(fetch()?);
        self.misses.fetch_add(1, Ordering::Relaxed);
        let mut generations = self
            .generations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.insert_active(&mut generations, key, Arc::clone(&value));
        Ok(value)
    }

    fn insert_active(&self, generations: &mut Generations<K, V>, key: K, value: Arc<V>) {
        if generations.active.len() >= self.capacity && !generations.active.contains_key(&key) {
            self.switches.fetch_add(1, Ordering::Relaxed);
            generations.background = mem::take(&mut generations.active);
        }
        generations.active.insert(key, value);
    }

    /// Drop every cached entry in both generations
    pub fn clear(&self) {
        let mut generations = self
            .generations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        generations.active.clear();
        generations.background.clear();
    }

    /// Entries currently held across both generations
    pub fn len(&self) -> usize {
        let generations = self
            .generations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        generations.active.len() + generations.background.len()
    }

    /// True when both generations are empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Counter snapshot
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            requests: self.requests.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            switches: self.switches.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    fn fetch(value: u32) -> impl FnOnce() -> Result<u32, Infallible> {
        move || Ok(value)
    }

    #[test]
    fn hit_after_miss() {
        let cache = TwoGenerationCache::new(4);
        assert_eq!(*cache.get_or_try_insert_with(1, fetch(10)).unwrap(), 10);
        assert_eq!(*cache.get_or_try_insert_with(1, fetch(99)).unwrap(), 10);
        let stats = cache.stats();
        assert_eq!(stats.requests, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.switches, 0);
    }

    #[test]
    fn switch_discards_oldest_generation() {
        let cache = TwoGenerationCache::new(2);
        cache.get_or_try_insert_with(1, fetch(1)).unwrap();
        cache.get_or_try_insert_with(2, fetch(2)).unwrap();
        // Third insert switches; keys 1 and 2 move to background.
        cache.get_or_try_insert_with(3, fetch(3)).unwrap();
        assert_eq!(cache.stats().switches, 1);

        // Key 1 promotes out of background without a fetch.
        let hit = cache
            .get_or_try_insert_with(1, || Err("fetch should not run"))
            .unwrap();
        assert_eq!(*hit, 1);

        // Another switch drops key 2 entirely.
        cache.get_or_try_insert_with(4, fetch(4)).unwrap();
        cache.get_or_try_insert_with(5, fetch(5)).unwrap();
        let miss = cache.get_or_try_insert_with(2, fetch(22)).unwrap();
        assert_eq!(*miss, 22, "key 2 was evicted and refetched");
    }

    #[test]
    fn promotion_counts_as_request_not_miss() {
        let cache = TwoGenerationCache::new(1);
        cache.get_or_try_insert_with(1, fetch(1)).unwrap();
        cache.get_or_try_insert_with(2, fetch(2)).unwrap(); // switch, 1 -> background
        let before = cache.stats();
        cache
            .get_or_try_insert_with(1, || Err("fetch should not run"))
            .unwrap();
        let after = cache.stats();
        assert_eq!(after.requests, before.requests + 1);
        assert_eq!(after.misses, before.misses);
    }

    #[test]
    fn fetch_error_leaves_cache_unchanged() {
        let cache: TwoGenerationCache<u32, u32> = TwoGenerationCache::new(4);
        let result = cache.get_or_try_insert_with(1, || Err("boom"));
        assert_eq!(result.unwrap_err(), "boom");
        assert!(cache.is_empty());
        assert_eq!(cache.stats().requests, 1);
    }

    #[test]
    fn concurrent_lookups_converge() {
        let cache = Arc::new(TwoGenerationCache::new(64));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for key in 0..32u32 {
                        let value = cache.get_or_try_insert_with(key, fetch(key * 2)).unwrap();
                        assert_eq!(*value, key * 2);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.stats().requests, 8 * 32);
    }
}
