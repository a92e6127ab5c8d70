//! Size-bounded cache of blob bytes keyed by checksum.
//!
//! Backed by `moka::sync::Cache` with a byte weigher. Each entry weighs at
//! least `max_bytes / max_entries`, so the entry limit holds alongside the
//! byte limit. Objects larger than the byte budget are never cached.
//! Eviction is approximate and runs during cache maintenance.

use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;

use serde::Serialize;

use crate::checksum::Checksum;

#[derive(Debug, Clone, Copy)]
pub struct CacheLimits {
    pub max_entries: usize,
    pub max_bytes: u64,
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self {
            max_entries: 1024,
            max_bytes: 64 * 1024 * 1024,
        }
    }
}

impl CacheLimits {
    /// Smallest weight any entry is charged.
    fn min_weight(&self) -> u64 {
        (self.max_bytes / self.max_entries.max(1) as u64).max(1)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

pub struct BlobCache {
    limits: CacheLimits,
    cache: moka::sync::Cache<Checksum, Arc<Vec<u8>>>,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for BlobCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobCache")
            .field("limits", &self.limits)
            .field("entry_count", &self.cache.entry_count())
            .field("weighted_size", &self.cache.weighted_size())
            .finish()
    }
}

impl BlobCache {
    pub fn new(limits: CacheLimits) -> Self {
        let counters = Arc::new(Counters::default());
        let listener_counters = counters.clone();
        let min_weight = limits.min_weight();

        let cache = moka::sync::Cache::builder()
            .weigher(move |_key: &Checksum, value: &Arc<Vec<u8>>| -> u32 {
                // moka weights are u32
                (value.len() as u64).max(min_weight).min(u32::MAX as u64) as u32
            })
            .max_capacity(limits.max_bytes)
            .eviction_listener(move |_key, _value, cause| {
                if cause.was_evicted() {
                    listener_counters.evictions.fetch_add(1, Relaxed);
                }
            })
            .build();

        Self {
            limits,
            cache,
            counters,
        }
    }

    pub fn get(&self, key: &Checksum) -> Option<Arc<Vec<u8>>> {
        let hit = self.cache.get(key);
        let counter = if hit.is_some() {
            &self.counters.hits
        } else {
            &self.counters.misses
        };
        counter.fetch_add(1, Relaxed);
        hit
    }

    pub fn contains(&self, key: &Checksum) -> bool {
        self.cache.contains_key(key)
    }

    /// Insert or refresh an entry. Returns `false` when the object is too
    /// large to cache.
    pub fn put(&self, key: &Checksum, data: &[u8]) -> bool {
        let size = data.len() as u64;
        if self.limits.max_entries == 0 || size > self.limits.max_bytes || size > u32::MAX as u64 {
            return false;
        }
        self.cache.insert(key.clone(), Arc::new(data.to_vec()));
        true
    }

    pub fn remove(&self, key: &Checksum) -> bool {
        self.cache.remove(key).is_some()
    }

    /// Counters after pending maintenance has run. `bytes` is the weight
    /// charged against `max_bytes`.
    pub fn stats(&self) -> CacheStats {
        self.cache.run_pending_tasks();
        CacheStats {
            entries: self.cache.entry_count() as usize,
            bytes: self.cache.weighted_size(),
            hits: self.counters.hits.load(Relaxed),
            misses: self.counters.misses.load(Relaxed),
            evictions: self.counters.evictions.load(Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::ChecksumAlgorithm;

    fn key(s: &str) -> Checksum {
        Checksum::compute(ChecksumAlgorithm::Sha256, s.as_bytes())
    }

    #[test]
    fn test_entry_limit_holds() {
        let cache = BlobCache::new(CacheLimits {
            max_entries: 2,
            max_bytes: 1024,
        });
        for name in ["a", "b", "c", "d", "e"] {
            assert!(cache.put(&key(name), name.as_bytes()));
        }
        let stats = cache.stats();
        assert!(stats.entries <= 2, "entries: {}", stats.entries);
        assert!(stats.bytes <= 1024);
    }

    #[test]
    fn test_byte_limit_holds() {
        let cache = BlobCache::new(CacheLimits {
            max_entries: 10,
            max_bytes: 10,
        });
        cache.put(&key("a"), &[0; 6]);
        cache.put(&key("b"), &[0; 6]);
        let stats = cache.stats();
        assert!(stats.entries <= 1);
        assert!(stats.bytes <= 10);
        assert!(!cache.put(&key("big"), &[0; 11]));
        assert!(!cache.contains(&key("big")));
    }

    #[test]
    fn test_refresh_and_remove() {
        let cache = BlobCache::new(CacheLimits {
            max_entries: 1024,
            max_bytes: 1024,
        });
        cache.put(&key("a"), b"one");
        cache.put(&key("a"), b"three");
        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.bytes, 5);
        assert_eq!(cache.get(&key("a")).unwrap().as_slice(), b"three");
        assert!(cache.remove(&key("a")));
        assert!(cache.get(&key("a")).is_none());
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
        assert_eq!(stats.bytes, 0);
    }
}
