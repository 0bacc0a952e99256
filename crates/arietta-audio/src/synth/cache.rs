//! Bounded cache of synthesized note segments.
//!
//! The cache is sharded so concurrent lookups for different notes do not
//! serialize on a single lock. Eviction is deliberately simple: when the
//! total entry count passes the hard cap, every shard is cleared wholesale
//! before the new entry is inserted. Not recency-aware.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Hard cap on cached segments across all shards
pub const NOTE_SEGMENT_CACHE_CAPACITY: usize = 2048;

const SHARD_COUNT: usize = 8;

/// Cache key identifying one synthesized note segment.
///
/// `tempo_key` is the tempo quantized to `round(bpm * 1000)` so nearby
/// floating-point tempos hit the same entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NoteSegmentKey {
    pub program: u8,
    pub pitch: u8,
    pub duration_ticks: u64,
    pub tempo_key: u32,
    pub pulses_per_quarter: u32,
    pub sample_rate: u32,
}

/// Cache statistics snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheInfo {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Sharded, bounded map from [`NoteSegmentKey`] to immutable sample buffers.
pub struct NoteSegmentCache {
    shards: Vec<Mutex<HashMap<NoteSegmentKey, Arc<[f32]>>>>,
    entries: AtomicUsize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl NoteSegmentCache {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
            entries: AtomicUsize::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn shard_for(&self, key: &NoteSegmentKey) -> &Mutex<HashMap<NoteSegmentKey, Arc<[f32]>>> {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }

    /// Look up a segment, recording a hit or miss.
    pub fn get(&self, key: &NoteSegmentKey) -> Option<Arc<[f32]>> {
        let shard = self.shard_for(key).lock().expect("cache shard poisoned");
        match shard.get(key) {
            Some(segment) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(Arc::clone(segment))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert a freshly synthesized segment, clearing the whole cache first
    /// when the entry count has passed the cap.
    pub fn insert(&self, key: NoteSegmentKey, segment: Arc<[f32]>) {
        if self.entries.load(Ordering::Relaxed) > NOTE_SEGMENT_CACHE_CAPACITY {
            self.clear();
        }
        let mut shard = self.shard_for(&key).lock().expect("cache shard poisoned");
        if shard.insert(key, segment).is_none() {
            self.entries.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drop every cached segment and reset the entry count.
    pub fn clear(&self) {
        for shard in &self.shards {
            shard.lock().expect("cache shard poisoned").clear();
        }
        self.entries.store(0, Ordering::Relaxed);
        log::debug!("note segment cache cleared");
    }

    /// Current statistics (hits, misses, live entries)
    pub fn info(&self) -> CacheInfo {
        CacheInfo {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.load(Ordering::Relaxed),
        }
    }
}

impl Default for NoteSegmentCache {
    fn default() -> Self {
        Self::new()
    }
}
