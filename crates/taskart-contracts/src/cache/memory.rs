use std::time::{Duration, Instant};

use indexmap::IndexMap;

use crate::keys::CacheKey;

pub const DEFAULT_MEMORY_CAPACITY: usize = 50;
pub const DEFAULT_MEMORY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub data_uri: String,
    pub stored_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryLookup<'a> {
    Hit(&'a str),
    Expired,
    Miss,
}

/// Bounded in-process LRU. Iteration order of `entries` is recency order:
/// index 0 is the least recently used entry.
#[derive(Debug)]
pub struct MemoryCache {
    entries: IndexMap<CacheKey, CacheEntry>,
    capacity: usize,
    ttl: Duration,
    evictions: u64,
}

impl MemoryCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: IndexMap::new(),
            capacity: capacity.max(1),
            ttl,
            evictions: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Looks up `key`, refreshing its recency on a hit and dropping it when
    /// its TTL has passed.
    pub fn get(&mut self, key: &CacheKey) -> MemoryLookup<'_> {
        let Some(index) = self.entries.get_index_of(key) else {
            return MemoryLookup::Miss;
        };
        let expired = self.entries[index].stored_at.elapsed() > self.ttl;
        if expired {
            self.entries.shift_remove_index(index);
            return MemoryLookup::Expired;
        }
        let last = self.entries.len() - 1;
        self.entries.move_index(index, last);
        MemoryLookup::Hit(self.entries[last].data_uri.as_str())
    }

    /// Inserts or replaces `key` as the most recently used entry, evicting
    /// the least recently used one when full. Returns the evicted key.
    pub fn insert(&mut self, key: CacheKey, data_uri: String) -> Option<CacheKey> {
        self.entries.shift_remove(&key);
        let mut evicted = None;
        if self.entries.len() >= self.capacity {
            if let Some((old_key, _)) = self.entries.shift_remove_index(0) {
                self.evictions += 1;
                evicted = Some(old_key);
            }
        }
        self.entries.insert(
            key.clone(),
            CacheEntry {
                key,
                data_uri,
                stored_at: Instant::now(),
            },
        );
        evicted
    }

    pub fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        self.entries.shift_remove(key)
    }
}
