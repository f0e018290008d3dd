// Copyright 2024-2026 VRAM-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! Priority-scored texture cache.
//!
//! Entries are keyed by a 64-bit texture hash and hold a device handle plus
//! access metadata. A successful insert transfers ownership of the texture to
//! the cache; eviction, removal and teardown destroy it through the device.
//! A rejected insert leaves ownership with the caller.
//!
//! The table sits behind a reader/writer lock. Hits take the read lock and
//! update per-entry atomics; inserts, eviction passes and handle swaps take
//! the write lock for their whole duration, so no reader observes a
//! half-evicted entry.

mod entry;
mod eviction;
mod lease;
mod stats;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::compression::{CompressionError, CompressionLevel, TextureCompression};
use crate::device::{DeviceError, GraphicsDevice, TextureHandle};
use crate::monitor::estimate_fragmentation;
use crate::pattern::{AccessPattern, AccessPatternAnalyzer, PatternConfig};
use crate::worker::PeriodicWorker;

use entry::CacheEntry;
use eviction::select_victims;

pub use entry::CacheEntryInfo;
pub use eviction::{priority_score, ScoreInputs};
pub use lease::TextureLease;
pub use stats::MemoryStats;

const MIB: usize = 1024 * 1024;
const MAX_COMPRESSIONS_PER_PASS: usize = 4;
const MAX_PRELOAD_REQUESTS: usize = 1024;
/// Widest frame range whose hashes are enumerated on invalidation.
const MAX_HASHED_RANGE: u32 = 65_536;

/// Cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Upper bound on resident bytes.
    pub max_cache_size: usize,
    /// VRAM the optimizer tries to leave free for other consumers.
    pub min_free_vram: usize,
    /// Fraction of the effective cap above which the background pass trims.
    pub eviction_threshold: f32,
    pub max_entries: usize,
    pub enable_compression: bool,
    pub enable_prediction: bool,
    /// Frames ahead of the playhead marked as predicted-needed.
    pub prediction_lookahead: usize,
    /// Inserts with a lower quality score are rejected.
    pub quality_threshold: f32,
    /// Idle age after which the background pass purges an entry.
    pub entry_ttl_secs: u64,
    /// Idle age after which garbage collection purges an entry.
    pub gc_idle_secs: u64,
    /// `force_cleanup` trims to this fraction of the effective cap.
    pub cleanup_target_ratio: f32,
    pub background_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_cache_size: 2048 * MIB,
            min_free_vram: 512 * MIB,
            eviction_threshold: 0.85,
            max_entries: 10_000,
            enable_compression: true,
            enable_prediction: true,
            prediction_lookahead: 60,
            quality_threshold: 0.1,
            entry_ttl_secs: 30 * 60,
            gc_idle_secs: 60,
            cleanup_target_ratio: 0.5,
            background_interval_ms: 100,
        }
    }
}

impl CacheConfig {
    pub fn entry_ttl(&self) -> Duration {
        Duration::from_secs(self.entry_ttl_secs)
    }

    pub fn gc_idle(&self) -> Duration {
        Duration::from_secs(self.gc_idle_secs)
    }

    pub fn background_interval(&self) -> Duration {
        Duration::from_millis(self.background_interval_ms.max(1))
    }
}

/// Reasons an insert was rejected.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Quality {quality} below threshold {threshold}")]
    BelowQualityThreshold { quality: f32, threshold: f32 },

    #[error("Texture of {size} bytes exceeds cache capacity of {max} bytes")]
    Oversized { size: usize, max: usize },

    #[error("Cannot free space: required {required} bytes, evictable {evictable} bytes")]
    CapacityExhausted { required: usize, evictable: usize },

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),
}

/// Work done by one background pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptimizationReport {
    pub expired: usize,
    pub trimmed: usize,
    pub compressed: usize,
    pub predicted: usize,
}

/// Deterministic 64-bit hash of a frame index and texture identifier.
pub fn generate_texture_hash(frame: u32, identifier: &str) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    for byte in identifier.bytes().chain(frame.to_le_bytes()) {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// Hash of the decoded texture for `frame`, as inserted by streaming.
pub fn frame_texture_hash(frame: u32) -> u64 {
    generate_texture_hash(frame, "frame")
}

struct CacheState {
    entries: HashMap<u64, CacheEntry>,
    total_bytes: usize,
}

/// Intelligent texture cache.
pub struct IntelligentCache {
    device: Arc<dyn GraphicsDevice>,
    compression: Arc<TextureCompression>,
    analyzer: AccessPatternAnalyzer,
    config: RwLock<CacheConfig>,
    state: RwLock<CacheState>,
    counters: stats::Counters,
    epoch: Instant,
    current_frame: AtomicU32,
    /// `f32` bits of the current memory pressure.
    pressure: AtomicU32,
    preload_requests: Mutex<VecDeque<u32>>,
    background: Mutex<Option<PeriodicWorker>>,
}

impl IntelligentCache {
    pub fn new(
        device: Arc<dyn GraphicsDevice>,
        compression: Arc<TextureCompression>,
        config: CacheConfig,
        pattern: PatternConfig,
    ) -> Self {
        Self {
            device,
            compression,
            analyzer: AccessPatternAnalyzer::new(pattern),
            config: RwLock::new(config),
            state: RwLock::new(CacheState {
                entries: HashMap::new(),
                total_bytes: 0,
            }),
            counters: stats::Counters::default(),
            epoch: Instant::now(),
            current_frame: AtomicU32::new(0),
            pressure: AtomicU32::new(0f32.to_bits()),
            preload_requests: Mutex::new(VecDeque::new()),
            background: Mutex::new(None),
        }
    }

    // ---- insertion ----

    /// Insert a texture. Returns false when rejected; the caller then still
    /// owns `handle`.
    pub fn put_texture(&self, hash: u64, handle: TextureHandle, quality: f32) -> bool {
        self.log_rejection(hash, self.try_put_texture(hash, handle, quality, None))
    }

    /// Insert a texture that belongs to `frame`.
    pub fn put_texture_for_frame(&self, hash: u64, frame: u32, handle: TextureHandle, quality: f32) -> bool {
        self.log_rejection(hash, self.try_put_texture(hash, handle, quality, Some(frame)))
    }

    /// Insert with a typed rejection reason.
    pub fn try_put_texture(
        &self,
        hash: u64,
        handle: TextureHandle,
        quality: f32,
        source_frame: Option<u32>,
    ) -> Result<(), CacheError> {
        let result = self.insert(hash, handle, quality, source_frame);
        if result.is_err() {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    fn insert(
        &self,
        hash: u64,
        handle: TextureHandle,
        quality: f32,
        source_frame: Option<u32>,
    ) -> Result<(), CacheError> {
        let (threshold, max_size, max_entries) = {
            let c = self.config.read();
            (c.quality_threshold, c.max_cache_size, c.max_entries.max(1))
        };
        if !(quality >= threshold) {
            return Err(CacheError::BelowQualityThreshold { quality, threshold });
        }

        let desc = self.device.texture_desc(handle)?;
        let size = self.device.texture_size(handle)?;
        if size > max_size {
            return Err(CacheError::Oversized { size, max: max_size });
        }

        let cap = self.effective_capacity();
        let now = Instant::now();
        let frame = self.current_frame();
        let mut state = self.state.write();

        if let Some(existing) = state.entries.get_mut(&hash) {
            existing.touch(now, self.epoch, frame);
            existing.quality_score = quality.min(1.0);
            if source_frame.is_some() {
                existing.source_frame = source_frame;
            }
            let resident = existing.handle;
            drop(state);
            if resident != handle {
                self.destroy(handle);
            }
            tracing::debug!(hash, "Duplicate insert refreshed resident entry");
            return Ok(());
        }

        let need_bytes = (state.total_bytes + size).saturating_sub(cap);
        let need_entries = (state.entries.len() + 1).saturating_sub(max_entries);
        if need_bytes > 0 || need_entries > 0 {
            let candidates = state
                .entries
                .values()
                .filter(|e| e.is_evictable())
                .map(|e| e.candidate(now, self.epoch, frame))
                .collect();
            let selection = select_victims(candidates, need_bytes, need_entries);
            if !selection.satisfied {
                return Err(CacheError::CapacityExhausted {
                    required: size,
                    evictable: selection.freed,
                });
            }
            self.evict_locked(&mut state, &selection.victims);
        }

        let entry = CacheEntry::new(
            hash,
            handle,
            size,
            desc.compression,
            quality.min(1.0),
            source_frame,
            now,
            self.epoch,
            frame,
        );
        state.total_bytes += size;
        state.entries.insert(hash, entry);
        tracing::debug!(hash, size, total = state.total_bytes, "Texture cached");
        Ok(())
    }

    fn log_rejection(&self, hash: u64, result: Result<(), CacheError>) -> bool {
        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(hash, error = %e, "Texture rejected");
                false
            }
        }
    }

    // ---- lookup ----

    /// Look up a texture, promoting compressed entries to raw on access.
    pub fn get_texture(&self, hash: u64) -> Option<TextureHandle> {
        self.lookup(hash, false).map(|(handle, _)| handle)
    }

    /// Look up and pin a texture for the lifetime of the returned lease.
    pub fn acquire_texture(&self, hash: u64) -> Option<TextureLease> {
        let (handle, refs) = self.lookup(hash, true)?;
        let refs = refs?;
        Some(TextureLease::new(hash, handle, refs))
    }

    /// Residency check without statistics or access side effects.
    pub fn contains(&self, hash: u64) -> bool {
        self.state.read().entries.contains_key(&hash)
    }

    pub fn entry_info(&self, hash: u64) -> Option<CacheEntryInfo> {
        let now = Instant::now();
        self.state
            .read()
            .entries
            .get(&hash)
            .map(|e| e.info(now, self.epoch, self.current_frame()))
    }

    fn lookup(&self, hash: u64, pin: bool) -> Option<(TextureHandle, Option<Arc<AtomicU32>>)> {
        let now = Instant::now();
        let frame = self.current_frame();
        let compressed = {
            let state = self.state.read();
            let Some(entry) = state.entries.get(&hash) else {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            };
            entry.touch(now, self.epoch, frame);
            if !entry.is_compressed() {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                return Some((entry.handle, pin.then(|| pin_entry(entry))));
            }
            entry.handle
        };
        self.promote(hash, compressed, pin)
    }

    /// Swap a compressed entry for a raw copy.
    fn promote(
        &self,
        hash: u64,
        compressed: TextureHandle,
        pin: bool,
    ) -> Option<(TextureHandle, Option<Arc<AtomicU32>>)> {
        let raw = match self.compression.decompress_copy(compressed) {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!(hash, error = %e, "Failed to promote compressed texture");
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        let raw_size = match self.device.texture_size(raw) {
            Ok(size) => size,
            Err(e) => {
                tracing::warn!(hash, error = %e, "Promoted texture vanished");
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        let cap = self.effective_capacity();
        let now = Instant::now();
        let frame = self.current_frame();
        let mut state = self.state.write();

        let packed_size = match state.entries.get(&hash) {
            None => {
                drop(state);
                self.destroy(raw);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Some(entry) if entry.handle != compressed => {
                // Promoted or replaced concurrently.
                let result = (!entry.is_compressed()).then(|| (entry.handle, pin.then(|| pin_entry(entry))));
                drop(state);
                self.destroy(raw);
                let counter = if result.is_some() { &self.counters.hits } else { &self.counters.misses };
                counter.fetch_add(1, Ordering::Relaxed);
                return result;
            }
            Some(entry) => entry.memory_size,
        };

        // The raw copy must fit under the cap before it replaces the packed one.
        let need_bytes = (state.total_bytes - packed_size + raw_size).saturating_sub(cap);
        if need_bytes > 0 {
            let candidates = state
                .entries
                .values()
                .filter(|e| e.hash != hash && e.is_evictable())
                .map(|e| e.candidate(now, self.epoch, frame))
                .collect();
            let selection = select_victims(candidates, need_bytes, 0);
            if !selection.satisfied {
                drop(state);
                self.destroy(raw);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(hash, raw_size, need_bytes, "No room to promote compressed texture");
                return None;
            }
            self.evict_locked(&mut state, &selection.victims);
        }

        let CacheState {
            entries,
            total_bytes,
        } = &mut *state;
        let Some(entry) = entries.get_mut(&hash) else {
            drop(state);
            self.destroy(raw);
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        *total_bytes = *total_bytes - entry.memory_size + raw_size;
        entry.handle = raw;
        entry.memory_size = raw_size;
        entry.compression = CompressionLevel::None;
        let refs = pin.then(|| pin_entry(entry));
        drop(state);

        self.destroy(compressed);
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(hash, raw_size, "Compressed texture promoted on access");
        Some((raw, refs))
    }

    // ---- removal and flags ----

    /// Remove and destroy an entry. Absent hashes are a counted no-op;
    /// leased entries are left in place.
    pub fn remove_texture(&self, hash: u64) -> bool {
        let mut state = self.state.write();
        match state.entries.get(&hash) {
            None => {
                self.counters.noop_removes.fetch_add(1, Ordering::Relaxed);
                false
            }
            Some(entry) if entry.reference_count() > 0 => {
                tracing::debug!(hash, "Remove skipped, entry is leased");
                false
            }
            Some(_) => {
                if let Some(entry) = self.remove_locked(&mut state, hash) {
                    self.destroy(entry.handle);
                }
                true
            }
        }
    }

    /// Set or clear eviction protection. Returns false when absent.
    pub fn mark_critical(&self, hash: u64, critical: bool) -> bool {
        match self.state.write().entries.get_mut(&hash) {
            Some(entry) => {
                entry.is_critical = critical;
                true
            }
            None => false,
        }
    }

    // ---- frame awareness ----

    pub fn notify_frame_access(&self, frame: u32) {
        self.current_frame.store(frame, Ordering::SeqCst);
        self.analyzer.record_access(frame);
    }

    pub fn current_frame(&self) -> u32 {
        self.current_frame.load(Ordering::SeqCst)
    }

    /// Mark resident frames in the range as predicted-needed and queue
    /// preload requests for the rest. Returns the number queued.
    pub fn preload_frame_range(&self, start: u32, end: u32) -> usize {
        let (lo, hi) = (start.min(end), start.max(end));
        let limit = self.config.read().max_entries.min(MAX_PRELOAD_REQUESTS) as u32;
        let hi = hi.min(lo.saturating_add(limit.saturating_sub(1)));

        let missing: Vec<u32> = {
            let state = self.state.read();
            (lo..=hi)
                .filter(|f| match state.entries.get(&frame_texture_hash(*f)) {
                    Some(entry) => {
                        entry.set_predicted(true);
                        false
                    }
                    None => true,
                })
                .collect()
        };
        self.queue_preloads(missing)
    }

    /// Drop entries belonging to frames in the range. Leased entries stay.
    pub fn invalidate_frame_range(&self, start: u32, end: u32) -> usize {
        let (lo, hi) = (start.min(end), start.max(end));
        let hashes: HashSet<u64> = if hi - lo <= MAX_HASHED_RANGE {
            (lo..=hi).map(frame_texture_hash).collect()
        } else {
            HashSet::new()
        };

        let mut state = self.state.write();
        let victims: Vec<u64> = state
            .entries
            .values()
            .filter(|e| match e.source_frame {
                Some(f) => (lo..=hi).contains(&f),
                None => hashes.contains(&e.hash),
            })
            .filter(|e| e.reference_count() == 0)
            .map(|e| e.hash)
            .collect();
        for hash in &victims {
            if let Some(entry) = self.remove_locked(&mut state, *hash) {
                self.destroy(entry.handle);
            }
        }
        drop(state);

        self.preload_requests.lock().retain(|f| !(lo..=hi).contains(f));
        if !victims.is_empty() {
            tracing::debug!(start = lo, end = hi, removed = victims.len(), "Frame range invalidated");
        }
        victims.len()
    }

    /// Drain frames queued for loading by prediction or `preload_frame_range`.
    pub fn take_preload_requests(&self) -> Vec<u32> {
        self.preload_requests.lock().drain(..).collect()
    }

    pub fn predicted_frames(&self) -> Vec<u32> {
        let lookahead = self.config.read().prediction_lookahead;
        self.analyzer.predicted_frames(lookahead)
    }

    pub fn current_pattern(&self) -> AccessPattern {
        self.analyzer.pattern()
    }

    pub fn reset_access_pattern(&self) {
        self.analyzer.reset();
    }

    fn queue_preloads(&self, frames: Vec<u32>) -> usize {
        let mut queue = self.preload_requests.lock();
        let mut queued = 0;
        for f in frames {
            if queue.len() >= MAX_PRELOAD_REQUESTS {
                break;
            }
            if !queue.contains(&f) {
                queue.push_back(f);
                queued += 1;
            }
        }
        queued
    }

    // ---- memory management ----

    /// Purge expired entries, then trim to the cleanup target.
    /// Returns bytes freed.
    pub fn force_cleanup(&self) -> usize {
        let (ttl, ratio) = {
            let c = self.config.read();
            (c.entry_ttl(), c.cleanup_target_ratio)
        };
        let target = (self.effective_capacity() as f64 * ratio.clamp(0.0, 1.0) as f64) as usize;

        let mut state = self.state.write();
        let freed = self.purge_idle_locked(&mut state, ttl) + self.trim_locked(&mut state, target, None);
        tracing::info!(freed, remaining = state.total_bytes, "Forced cache cleanup");
        freed
    }

    /// Evict every evictable entry. Returns bytes freed.
    pub fn purge_evictable(&self) -> usize {
        let mut state = self.state.write();
        let victims: Vec<u64> = state
            .entries
            .values()
            .filter(|e| e.is_evictable())
            .map(|e| e.hash)
            .collect();
        let freed = self.evict_locked(&mut state, &victims);
        tracing::warn!(freed, evicted = victims.len(), "Purged all evictable entries");
        freed
    }

    /// Purge entries idle past the GC age, then trim to the cap.
    pub fn trigger_garbage_collection(&self) -> usize {
        let idle = self.config.read().gc_idle();
        let cap = self.effective_capacity();
        let mut state = self.state.write();
        self.purge_idle_locked(&mut state, idle) + self.trim_locked(&mut state, cap, None)
    }

    /// Make room for `bytes` more within the cache cap.
    pub fn ensure_free_memory(&self, bytes: usize) -> bool {
        let cap = self.effective_capacity();
        let mut state = self.state.write();
        if state.total_bytes + bytes <= cap {
            return true;
        }
        let target = if bytes >= cap {
            (cap as f64 * 0.7) as usize
        } else {
            cap - bytes
        };
        self.trim_locked(&mut state, target, None);
        state.total_bytes + bytes <= cap
    }

    /// Evict lowest-priority entries until at least `bytes` are released.
    /// Returns bytes actually freed.
    pub fn free_memory(&self, bytes: usize) -> usize {
        let mut state = self.state.write();
        let target = state.total_bytes.saturating_sub(bytes);
        self.trim_locked(&mut state, target, None)
    }

    /// Shrink the effective cap under pressure (`0..=1`).
    pub fn set_memory_pressure(&self, pressure: f32) {
        let pressure = if pressure.is_nan() { 0.0 } else { pressure.clamp(0.0, 1.0) };
        self.pressure.store(pressure.to_bits(), Ordering::SeqCst);

        let cap = self.effective_capacity();
        let mut state = self.state.write();
        if state.total_bytes > cap {
            let freed = self.trim_locked(&mut state, cap, None);
            tracing::debug!(pressure, freed, "Cache trimmed to pressure-adjusted cap");
        }
    }

    pub fn memory_pressure(&self) -> f32 {
        f32::from_bits(self.pressure.load(Ordering::SeqCst))
    }

    /// `max_cache_size` shrunk by up to half under full pressure.
    pub fn effective_capacity(&self) -> usize {
        let max = self.config.read().max_cache_size;
        (max as f64 * (1.0 - self.memory_pressure() as f64 * 0.5)) as usize
    }

    // ---- background optimization ----

    /// One background tick: TTL purge, threshold trim, compression of idle
    /// entries and prediction marking.
    pub fn run_optimization_pass(&self) -> OptimizationReport {
        let config = self.config.read().clone();
        let now = Instant::now();
        let mut report = OptimizationReport::default();

        {
            let mut state = self.state.write();
            let before = state.entries.len();
            self.purge_idle_locked(&mut state, config.entry_ttl());
            report.expired = before - state.entries.len();

            let threshold = (self.effective_capacity() as f64 * config.eviction_threshold as f64) as usize;
            if state.total_bytes > threshold {
                let before = state.entries.len();
                self.trim_locked(&mut state, threshold, None);
                report.trimmed = before - state.entries.len();
            }
        }

        if config.enable_compression {
            report.compressed = self.compress_idle_entries(now);
        }
        if config.enable_prediction {
            report.predicted = self.apply_predictions(config.prediction_lookahead);
        }

        if report != OptimizationReport::default() {
            tracing::debug!(?report, "Cache optimization pass");
        }
        report
    }

    /// Run [`run_optimization_pass`](Self::run_optimization_pass) on a
    /// background thread. No-op when already running.
    pub fn start_background(self: &Arc<Self>, interval: Duration) -> std::io::Result<()> {
        let mut slot = self.background.lock();
        if slot.is_some() {
            return Ok(());
        }
        let worker = PeriodicWorker::spawn(
            "vram-cache-optimizer",
            interval,
            Arc::downgrade(self),
            |cache: &IntelligentCache| {
                cache.run_optimization_pass();
            },
        )?;
        *slot = Some(worker);
        tracing::info!(interval_ms = interval.as_millis() as u64, "Cache background optimization started");
        Ok(())
    }

    pub fn stop_background(&self) {
        let worker = self.background.lock().take();
        if let Some(worker) = worker {
            worker.stop();
            tracing::info!("Cache background optimization stopped");
        }
    }

    pub fn is_background_running(&self) -> bool {
        self.background.lock().is_some()
    }

    fn compress_idle_entries(&self, now: Instant) -> usize {
        let policy = self.compression.policy();
        let level = policy.background_level;
        if level == CompressionLevel::None {
            return 0;
        }
        let min_idle = Duration::from_millis(policy.min_idle_ms);
        let frame = self.current_frame();

        let mut candidates: Vec<(f32, u64, TextureHandle)> = {
            let state = self.state.read();
            state
                .entries
                .values()
                .filter(|e| {
                    !e.is_compressed()
                        && e.is_evictable()
                        && !e.is_predicted()
                        && e.memory_size >= policy.min_texture_bytes
                        && e.idle(now, self.epoch) >= min_idle
                        && self
                            .compression
                            .is_compression_beneficial(e.memory_size, e.access_frequency(now))
                })
                .map(|e| (e.priority(now, self.epoch, frame), e.hash, e.handle))
                .collect()
        };
        candidates.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

        let mut compressed = 0;
        for (_, hash, original) in candidates.into_iter().take(MAX_COMPRESSIONS_PER_PASS) {
            let packed = match self.compression.compress_copy(original, level) {
                Ok(h) => h,
                Err(CompressionError::Ineffective { .. }) => continue,
                Err(e) => {
                    tracing::debug!(hash, error = %e, "Skipping compression candidate");
                    continue;
                }
            };
            let packed_size = match self.device.texture_size(packed) {
                Ok(size) => size,
                Err(_) => continue,
            };

            let mut state = self.state.write();
            let CacheState {
                entries,
                total_bytes,
            } = &mut *state;
            match entries.get_mut(&hash) {
                Some(entry) if entry.handle == original && entry.is_evictable() => {
                    *total_bytes = *total_bytes - entry.memory_size + packed_size;
                    entry.handle = packed;
                    entry.memory_size = packed_size;
                    entry.compression = level;
                    drop(state);
                    self.destroy(original);
                    compressed += 1;
                }
                _ => {
                    drop(state);
                    self.destroy(packed);
                }
            }
        }
        compressed
    }

    fn apply_predictions(&self, lookahead: usize) -> usize {
        if !self.analyzer.prefetch_enabled() {
            return 0;
        }
        let frames = self.analyzer.predicted_frames(lookahead);
        if frames.is_empty() {
            return 0;
        }
        let current = self.current_frame();
        let frame_set: HashSet<u32> = frames.iter().copied().collect();
        let hash_set: HashSet<u64> = frames.iter().map(|f| frame_texture_hash(*f)).collect();

        let (marked, missing) = {
            let state = self.state.read();
            let mut marked = 0;
            let mut resident_frames = HashSet::new();
            for entry in state.entries.values() {
                let hit = match entry.source_frame {
                    Some(f) => frame_set.contains(&f),
                    None => hash_set.contains(&entry.hash),
                };
                if hit {
                    entry.set_predicted(true);
                    marked += 1;
                    if let Some(f) = entry.source_frame {
                        resident_frames.insert(f);
                    }
                } else if entry.is_predicted() && entry.anchor_frame().abs_diff(current) > lookahead as u32 {
                    entry.set_predicted(false);
                }
            }
            let missing: Vec<u32> = frames
                .iter()
                .copied()
                .filter(|f| !resident_frames.contains(f) && !state.entries.contains_key(&frame_texture_hash(*f)))
                .collect();
            (marked, missing)
        };
        self.queue_preloads(missing);
        marked
    }

    // ---- statistics and configuration ----

    pub fn get_statistics(&self) -> MemoryStats {
        let info = self.device.memory_info();
        let (cached, compressed, entries) = {
            let state = self.state.read();
            let compressed = state
                .entries
                .values()
                .filter(|e| e.is_compressed())
                .map(|e| e.memory_size)
                .sum();
            (state.total_bytes, compressed, state.entries.len())
        };
        let usage = if info.total > 0 {
            info.used as f32 / info.total as f32
        } else {
            0.0
        };

        let mut stats = MemoryStats {
            total_vram: info.total,
            used_vram: info.used,
            available_vram: info.available,
            cached_memory: cached,
            compressed_memory: compressed,
            fragmentation_ratio: estimate_fragmentation(usage, info.allocation_count),
            active_allocations: info.allocation_count,
            cache_entries: entries,
            ..MemoryStats::default()
        };
        self.counters.fill(&mut stats);
        stats
    }

    /// Resident bytes.
    pub fn get_cache_size(&self) -> usize {
        self.state.read().total_bytes
    }

    /// Resident bytes; same figure as [`get_cache_size`](Self::get_cache_size).
    pub fn get_total_bytes(&self) -> usize {
        self.get_cache_size()
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hit_ratio(&self) -> f32 {
        self.counters.hit_ratio()
    }

    pub fn reset_statistics(&self) {
        self.counters.reset();
    }

    pub fn get_config(&self) -> CacheConfig {
        self.config.read().clone()
    }

    /// Replace the configuration and trim to the new cap.
    pub fn update_config(&self, config: CacheConfig) {
        *self.config.write() = config;
        let cap = self.effective_capacity();
        let max_entries = self.config.read().max_entries.max(1);
        let mut state = self.state.write();
        if state.total_bytes > cap {
            self.trim_locked(&mut state, cap, None);
        }
        if state.entries.len() > max_entries {
            let excess = state.entries.len() - max_entries;
            self.evict_count_locked(&mut state, excess);
        }
    }

    pub fn compression(&self) -> &Arc<TextureCompression> {
        &self.compression
    }

    // ---- internals; callers hold the write lock ----

    fn destroy(&self, handle: TextureHandle) {
        if let Err(e) = self.device.destroy_texture(handle) {
            tracing::warn!(handle = %handle, error = %e, "Failed to destroy texture");
        }
    }

    fn remove_locked(&self, state: &mut CacheState, hash: u64) -> Option<CacheEntry> {
        let entry = state.entries.remove(&hash)?;
        state.total_bytes -= entry.memory_size;
        Some(entry)
    }

    fn evict_locked(&self, state: &mut CacheState, victims: &[u64]) -> usize {
        let mut freed = 0;
        for hash in victims {
            if let Some(entry) = self.remove_locked(state, *hash) {
                freed += entry.memory_size;
                self.destroy(entry.handle);
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(hash, size = entry.memory_size, "Texture evicted");
            }
        }
        freed
    }

    /// Evict lowest-priority entries until `target` bytes remain or no
    /// candidate is left.
    fn trim_locked(&self, state: &mut CacheState, target: usize, exclude: Option<u64>) -> usize {
        if state.total_bytes <= target {
            return 0;
        }
        let now = Instant::now();
        let frame = self.current_frame();
        let candidates = state
            .entries
            .values()
            .filter(|e| e.is_evictable() && Some(e.hash) != exclude)
            .map(|e| e.candidate(now, self.epoch, frame))
            .collect();
        let selection = select_victims(candidates, state.total_bytes - target, 0);
        self.evict_locked(state, &selection.victims)
    }

    fn evict_count_locked(&self, state: &mut CacheState, count: usize) -> usize {
        let now = Instant::now();
        let frame = self.current_frame();
        let candidates = state
            .entries
            .values()
            .filter(|e| e.is_evictable())
            .map(|e| e.candidate(now, self.epoch, frame))
            .collect();
        let selection = select_victims(candidates, 0, count);
        self.evict_locked(state, &selection.victims)
    }

    fn purge_idle_locked(&self, state: &mut CacheState, max_idle: Duration) -> usize {
        let now = Instant::now();
        let expired: Vec<u64> = state
            .entries
            .values()
            .filter(|e| e.is_evictable() && !e.is_predicted() && e.idle(now, self.epoch) > max_idle)
            .map(|e| e.hash)
            .collect();
        self.evict_locked(state, &expired)
    }
}

fn pin_entry(entry: &CacheEntry) -> Arc<AtomicU32> {
    entry.refs.fetch_add(1, Ordering::SeqCst);
    entry.refs.clone()
}

impl Drop for IntelligentCache {
    fn drop(&mut self) {
        if let Some(worker) = self.background.get_mut().take() {
            worker.stop();
        }
        let state = self.state.get_mut();
        for (_, entry) in state.entries.drain() {
            if let Err(e) = self.device.destroy_texture(entry.handle) {
                tracing::warn!(handle = %entry.handle, error = %e, "Failed to destroy texture on teardown");
            }
        }
        state.total_bytes = 0;
    }
}

#[cfg(test)]
#[path = "cache_tests.rs"]
mod tests;
