//! Bounded LRU cache of raw SST data-block bytes.
//!
//! Cache key is `(sst_id, block_offset)`; values are shared immutable
//! buffers so a hit costs one `Arc` clone. A single mutex covers the map
//! and recency bookkeeping, which is acceptable because lookups are O(1)
//! and the cache sits off the write path entirely.
//!
//! Recency is tracked with a monotonic stamp per entry plus a queue of
//! `(key, stamp)` observations: each access pushes a fresh observation and
//! eviction pops from the front, skipping observations whose stamp no
//! longer matches the entry. That preserves strict LRU order without a
//! linked list.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::config::BlockCacheConfig;

/// Cache key: (sst_id, block_offset).
pub type BlockKey = (u64, u64);

struct CacheEntry {
    data: Arc<Vec<u8>>,
    stamp: u64,
    hits: u64,
}

struct Inner {
    entries: HashMap<BlockKey, CacheEntry>,
    recency: VecDeque<(BlockKey, u64)>,
    bytes: usize,
    next_stamp: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    rejections: u64,
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub rejections: u64,
    pub bytes: usize,
    pub count: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

pub struct BlockCache {
    config: BlockCacheConfig,
    inner: Mutex<Inner>,
}

impl BlockCache {
    pub fn new(config: BlockCacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                recency: VecDeque::new(),
                bytes: 0,
                next_stamp: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
                rejections: 0,
            }),
        }
    }

    /// Looks up a block, promoting it to most-recently-used on a hit.
    pub fn get(&self, sst_id: u64, block_offset: u64) -> Option<Arc<Vec<u8>>> {
        let key = (sst_id, block_offset);
        let mut inner = self.inner.lock().unwrap();
        inner.next_stamp += 1;
        let stamp = inner.next_stamp;

        match inner.entries.get_mut(&key) {
            Some(entry) => {
                entry.stamp = stamp;
                entry.hits += 1;
                let data = Arc::clone(&entry.data);
                inner.recency.push_back((key, stamp));
                inner.hits += 1;
                Some(data)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Inserts a block at most-recently-used, evicting from the LRU end
    /// until the capacity invariants hold. Returns false when the block is
    /// rejected by the admission rules.
    pub fn put(&self, sst_id: u64, block_offset: u64, data: Arc<Vec<u8>>) -> bool {
        if data.is_empty() || data.len() > self.config.max_block_size {
            self.inner.lock().unwrap().rejections += 1;
            return false;
        }
        let utilization = data.len() as f64 / self.config.min_block_size as f64;
        if utilization < self.config.min_utilization {
            self.inner.lock().unwrap().rejections += 1;
            return false;
        }

        let key = (sst_id, block_offset);
        let mut inner = self.inner.lock().unwrap();
        inner.next_stamp += 1;
        let stamp = inner.next_stamp;

        if let Some(old) = inner.entries.insert(
            key,
            CacheEntry {
                data: Arc::clone(&data),
                stamp,
                hits: 0,
            },
        ) {
            inner.bytes -= old.data.len();
        }
        inner.bytes += data.len();
        inner.recency.push_back((key, stamp));

        self.evict(&mut inner);
        true
    }

    fn evict(&self, inner: &mut Inner) {
        while inner.bytes > self.config.max_capacity
            || (self.config.max_block_count > 0
                && inner.entries.len() > self.config.max_block_count)
        {
            let Some((key, stamp)) = inner.recency.pop_front() else {
                break;
            };
            // Stale observation: the entry was touched again later.
            let current = matches!(
                inner.entries.get(&key),
                Some(entry) if entry.stamp == stamp
            );
            if current {
                let entry = inner.entries.remove(&key).expect("entry checked above");
                inner.bytes -= entry.data.len();
                inner.evictions += 1;
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap();
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            rejections: inner.rejections,
            bytes: inner.bytes,
            count: inner.entries.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cache(max_capacity: usize) -> BlockCache {
        BlockCache::new(
            BlockCacheConfig::default()
                .max_capacity(max_capacity)
                .min_block_size(4)
                .max_block_size(64)
                .min_utilization(0.5),
        )
    }

    fn block(len: usize, fill: u8) -> Arc<Vec<u8>> {
        Arc::new(vec![fill; len])
    }

    #[test]
    fn test_get_and_put() {
        let cache = test_cache(1024);

        assert!(cache.get(1, 0).is_none());
        assert!(cache.put(1, 0, block(16, 0xaa)));
        assert_eq!(cache.get(1, 0).expect("expected hit").len(), 16);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.bytes, 16);
        assert_eq!(stats.count, 1);
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_evicts_in_lru_order() {
        let cache = test_cache(48);

        assert!(cache.put(1, 0, block(16, 1)));
        assert!(cache.put(1, 16, block(16, 2)));
        assert!(cache.put(1, 32, block(16, 3)));

        // Touch the oldest so the middle entry becomes LRU.
        assert!(cache.get(1, 0).is_some());

        assert!(cache.put(1, 48, block(16, 4)));
        assert!(cache.get(1, 16).is_none(), "LRU entry should be gone");
        assert!(cache.get(1, 0).is_some());
        assert!(cache.get(1, 32).is_some());
        assert!(cache.get(1, 48).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_capacity_invariant_holds() {
        let cache = test_cache(64);

        for i in 0..32 {
            cache.put(1, i * 16, block(16, i as u8));
        }

        let stats = cache.stats();
        assert!(stats.bytes <= 64, "cache holds {} bytes", stats.bytes);
        assert_eq!(stats.count, stats.bytes / 16);
    }

    #[test]
    fn test_rejects_oversized_block() {
        let cache = test_cache(1024);

        assert!(!cache.put(1, 0, block(65, 0)));
        assert!(cache.get(1, 0).is_none());
        assert_eq!(cache.stats().rejections, 1);
    }

    #[test]
    fn test_rejects_low_utilization_block() {
        let cache = test_cache(1024);

        // 1 byte against a 4-byte reference block is 0.25 utilization.
        assert!(!cache.put(1, 0, block(1, 0)));
        assert_eq!(cache.stats().rejections, 1);
        assert!(cache.put(1, 0, block(2, 0)));
    }

    #[test]
    fn test_put_replaces_existing_block() {
        let cache = test_cache(1024);

        assert!(cache.put(1, 0, block(16, 1)));
        assert!(cache.put(1, 0, block(32, 2)));

        let stats = cache.stats();
        assert_eq!(stats.count, 1);
        assert_eq!(stats.bytes, 32);
        assert_eq!(cache.get(1, 0).expect("expected hit")[0], 2);
    }

    #[test]
    fn test_max_block_count_limit() {
        let cache = BlockCache::new(
            BlockCacheConfig::default()
                .max_capacity(1024)
                .min_block_size(4)
                .max_block_size(64)
                .max_block_count(2)
                .min_utilization(0.0),
        );

        cache.put(1, 0, block(8, 0));
        cache.put(1, 8, block(8, 1));
        cache.put(1, 16, block(8, 2));

        let stats = cache.stats();
        assert_eq!(stats.count, 2);
        assert!(cache.get(1, 0).is_none());
    }
}
