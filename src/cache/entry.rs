//! Resident cache entry.
//!
//! Access metadata is atomic so hits only need the table's read lock.
//! Structural fields (handle, size, compression) change under the write lock.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use super::eviction::{priority_score, Candidate, ScoreInputs};
use crate::compression::CompressionLevel;
use crate::device::TextureHandle;

pub(crate) struct CacheEntry {
    pub hash: u64,
    pub handle: TextureHandle,
    pub refs: Arc<AtomicU32>,
    pub created: Instant,
    /// Nanoseconds since the cache epoch.
    last_access: AtomicU64,
    access_count: AtomicU32,
    frame_last_used: AtomicU32,
    pub source_frame: Option<u32>,
    pub quality_score: f32,
    pub memory_size: usize,
    pub compression: CompressionLevel,
    pub is_critical: bool,
    predicted: AtomicBool,
}

impl CacheEntry {
    pub fn new(
        hash: u64,
        handle: TextureHandle,
        memory_size: usize,
        compression: CompressionLevel,
        quality_score: f32,
        source_frame: Option<u32>,
        now: Instant,
        epoch: Instant,
        current_frame: u32,
    ) -> Self {
        Self {
            hash,
            handle,
            refs: Arc::new(AtomicU32::new(0)),
            created: now,
            last_access: AtomicU64::new(nanos_since(epoch, now)),
            access_count: AtomicU32::new(1),
            frame_last_used: AtomicU32::new(source_frame.unwrap_or(current_frame)),
            source_frame,
            quality_score,
            memory_size,
            compression,
            is_critical: false,
            predicted: AtomicBool::new(false),
        }
    }

    pub fn touch(&self, now: Instant, epoch: Instant, frame: u32) {
        self.last_access.store(nanos_since(epoch, now), Ordering::Relaxed);
        self.access_count.fetch_add(1, Ordering::Relaxed);
        self.frame_last_used.store(frame, Ordering::Relaxed);
    }

    pub fn idle(&self, now: Instant, epoch: Instant) -> Duration {
        let last = Duration::from_nanos(self.last_access.load(Ordering::Relaxed));
        now.saturating_duration_since(epoch + last)
    }

    pub fn access_count(&self) -> u32 {
        self.access_count.load(Ordering::Relaxed)
    }

    pub fn frame_last_used(&self) -> u32 {
        self.frame_last_used.load(Ordering::Relaxed)
    }

    pub fn is_predicted(&self) -> bool {
        self.predicted.load(Ordering::Relaxed)
    }

    pub fn set_predicted(&self, value: bool) {
        self.predicted.store(value, Ordering::Relaxed);
    }

    pub fn reference_count(&self) -> u32 {
        self.refs.load(Ordering::SeqCst)
    }

    pub fn is_compressed(&self) -> bool {
        self.compression != CompressionLevel::None
    }

    /// Critical and referenced entries are never eviction candidates.
    pub fn is_evictable(&self) -> bool {
        !self.is_critical && self.reference_count() == 0
    }

    /// Frame the entry is anchored to for distance calculations.
    pub fn anchor_frame(&self) -> u32 {
        self.source_frame.unwrap_or_else(|| self.frame_last_used())
    }

    /// Accesses per second over the entry's lifetime.
    pub fn access_frequency(&self, now: Instant) -> f32 {
        let age = now.saturating_duration_since(self.created).as_secs_f32().max(1.0);
        self.access_count() as f32 / age
    }

    pub fn priority(&self, now: Instant, epoch: Instant, current_frame: u32) -> f32 {
        priority_score(&ScoreInputs {
            quality_score: self.quality_score,
            idle: self.idle(now, epoch),
            access_count: self.access_count(),
            frame_distance: current_frame.abs_diff(self.frame_last_used()),
            is_critical: self.is_critical,
            is_predicted_needed: self.is_predicted(),
        })
    }

    pub fn candidate(&self, now: Instant, epoch: Instant, current_frame: u32) -> Candidate {
        Candidate {
            hash: self.hash,
            priority: self.priority(now, epoch, current_frame),
            created: self.created,
            size: self.memory_size,
        }
    }

    pub fn info(&self, now: Instant, epoch: Instant, current_frame: u32) -> CacheEntryInfo {
        CacheEntryInfo {
            hash: self.hash,
            handle: self.handle,
            reference_count: self.reference_count(),
            access_count: self.access_count(),
            frame_last_used: self.frame_last_used(),
            source_frame: self.source_frame,
            quality_score: self.quality_score,
            memory_size: self.memory_size,
            is_compressed: self.is_compressed(),
            compression_level: self.compression,
            is_critical: self.is_critical,
            is_predicted_needed: self.is_predicted(),
            idle_ms: self.idle(now, epoch).as_millis() as u64,
            priority: self.priority(now, epoch, current_frame),
        }
    }
}

fn nanos_since(epoch: Instant, now: Instant) -> u64 {
    now.saturating_duration_since(epoch).as_nanos() as u64
}

/// Read-only view of one entry.
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntryInfo {
    pub hash: u64,
    #[serde(skip)]
    pub handle: TextureHandle,
    pub reference_count: u32,
    pub access_count: u32,
    pub frame_last_used: u32,
    pub source_frame: Option<u32>,
    pub quality_score: f32,
    pub memory_size: usize,
    pub is_compressed: bool,
    pub compression_level: CompressionLevel,
    pub is_critical: bool,
    pub is_predicted_needed: bool,
    pub idle_ms: u64,
    pub priority: f32,
}
