//! Cache counters and the memory statistics snapshot.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Memory and cache statistics, recomputed on demand.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MemoryStats {
    pub total_vram: usize,
    pub used_vram: usize,
    pub available_vram: usize,
    pub cached_memory: usize,
    pub compressed_memory: usize,
    pub fragmentation_ratio: f32,
    pub active_allocations: usize,
    pub cache_entries: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub hit_ratio: f32,
    pub evictions: u64,
    pub rejected_inserts: u64,
    pub noop_removes: u64,
}

#[derive(Default)]
pub(crate) struct Counters {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
    pub rejected: AtomicU64,
    pub noop_removes: AtomicU64,
}

impl Counters {
    pub fn hit_ratio(&self) -> f32 {
        let hits = self.hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f32 / total as f32
        }
    }

    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        self.rejected.store(0, Ordering::Relaxed);
        self.noop_removes.store(0, Ordering::Relaxed);
    }

    pub fn fill(&self, stats: &mut MemoryStats) {
        stats.cache_hits = self.hits.load(Ordering::Relaxed);
        stats.cache_misses = self.misses.load(Ordering::Relaxed);
        stats.hit_ratio = self.hit_ratio();
        stats.evictions = self.evictions.load(Ordering::Relaxed);
        stats.rejected_inserts = self.rejected.load(Ordering::Relaxed);
        stats.noop_removes = self.noop_removes.load(Ordering::Relaxed);
    }
}
