//! Bounded entry cache with "select worst, maybe evict" replacement
//!
//! When full, the entry idle the longest is picked. It is evicted if it
//! has been idle past the retention time, and otherwise only with a small
//! probability; if it survives, the newcomer is turned away. The cache is
//! never larger than its configured bound.

use crate::buffer::ByteArray64;
use crate::config::CacheConfig;
use crate::entry::{DiskEntry, EntryId};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// Cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Entries accepted into the cache
    pub admissions: u64,
    /// Entries turned away (too large, or the worst entry survived)
    pub rejections: u64,
    pub evictions: u64,
    pub entries: usize,
    pub capacity: usize,
}

impl CacheStats {
    /// Hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

struct Cached {
    entry: DiskEntry,
    hits: u64,
    last_access: Instant,
}

/// Size compared against the cache threshold: content length for files,
/// body size for directories and symlinks
fn cached_size(entry: &DiskEntry) -> u64 {
    entry
        .file_bytes()
        .map_or_else(|| entry.serialized_size(), ByteArray64::len)
}

struct Inner {
    entries: HashMap<EntryId, Cached>,
    rng: StdRng,
    stats: CacheStats,
}

pub struct FileCache {
    inner: Mutex<Inner>,
    max_entries: usize,
    max_file_size: u64,
    retention: Duration,
    eviction_probability: f64,
}

impl FileCache {
    pub fn new(config: &CacheConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        FileCache {
            inner: Mutex::new(Inner {
                entries: HashMap::with_capacity(config.max_entries),
                rng,
                stats: CacheStats {
                    capacity: config.max_entries,
                    ..CacheStats::default()
                },
            }),
            max_entries: config.max_entries,
            max_file_size: config.max_file_size,
            retention: config.retention(),
            eviction_probability: config.eviction_probability,
        }
    }

    /// Look up an entry, refreshing its idle time
    pub fn get(&self, id: EntryId) -> Option<DiskEntry> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        match inner.entries.get_mut(&id) {
            Some(cached) => {
                cached.hits += 1;
                cached.last_access = Instant::now();
                let entry = cached.entry.clone();
                inner.stats.hits += 1;
                Some(entry)
            }
            None => {
                inner.stats.misses += 1;
                None
            }
        }
    }

    /// Try to admit an entry; returns whether it is now cached
    ///
    /// Safe to call from several threads at once.
    pub fn insert(&self, entry: DiskEntry) -> bool {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let id = entry.entry_id;

        if cached_size(&entry) > self.max_file_size {
            inner.stats.rejections += 1;
            return false;
        }

        if !inner.entries.contains_key(&id) && inner.entries.len() >= self.max_entries {
            let worst = inner
                .entries
                .iter()
                .min_by_key(|(_, cached)| cached.last_access)
                .map(|(id, cached)| (*id, cached.last_access.elapsed()));
            let Some((worst_id, idle)) = worst else {
                inner.stats.rejections += 1;
                return false;
            };

            let evict = idle > self.retention || inner.rng.gen_bool(self.eviction_probability);
            if !evict {
                inner.stats.rejections += 1;
                return false;
            }
            inner.entries.remove(&worst_id);
            inner.stats.evictions += 1;
            debug!("Evicted entry {} after {:?} idle", worst_id, idle);
        }

        inner.entries.insert(
            id,
            Cached {
                entry,
                hits: 0,
                last_access: Instant::now(),
            },
        );
        inner.stats.admissions += 1;
        true
    }

    pub fn remove(&self, id: EntryId) -> bool {
        self.inner.lock().entries.remove(&id).is_some()
    }

    pub fn contains(&self, id: EntryId) -> bool {
        self.inner.lock().entries.contains_key(&id)
    }

    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Times a cached entry has been served since it was admitted
    pub fn hits_for(&self, id: EntryId) -> Option<u64> {
        self.inner.lock().entries.get(&id).map(|cached| cached.hits)
    }

    /// Largest cached size, measured the way the threshold is
    pub fn largest_body(&self) -> u64 {
        self.inner
            .lock()
            .entries
            .values()
            .map(|cached| cached_size(&cached.entry))
            .max()
            .unwrap_or(0)
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            entries: inner.entries.len(),
            ..inner.stats
        }
    }
}
