// Copyright 2024-2026 VRAM-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! Read-ahead frame streaming.
//!
//! Keeps a window of upcoming frames resident in the cache. A pool of loader
//! threads pops frames from a bounded FIFO, decodes them through a
//! [`FrameLoader`] and hands the results back through a completion queue
//! that the owner drains into the cache. Every job carries the seek epoch;
//! completions from an older epoch or outside the current window are
//! destroyed and counted as dropped.

mod loader;

use std::collections::{HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::cache::{frame_texture_hash, IntelligentCache};
use crate::compression::CompressionLevel;
use crate::device::{DeviceError, GraphicsDevice, TextureHandle};
use crate::pattern::{AccessPatternAnalyzer, PatternConfig};

pub use loader::{FrameLoader, LoadedFrame, SyntheticFrameLoader};

/// Frames on each side of the playhead pinned by `prioritize_critical_textures`.
const CRITICAL_RADIUS: u32 = 10;
const GROW_STEP: u32 = 5;
const GROW_LIMIT: u32 = 100;
const SHRINK_STEP: u32 = 2;
const SHRINK_LIMIT: u32 = 10;
const OVERFULL_UTILIZATION: f32 = 0.9;
const CRITICAL_PRESSURE: f32 = 0.9;
const LOAD_TIME_ALPHA: f32 = 0.1;
const IDLE_WAIT: Duration = Duration::from_millis(10);

/// Quality ladder used for adaptive streaming.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamQuality {
    #[default]
    Full,
    Compressed(CompressionLevel),
}

impl StreamQuality {
    pub fn compression_level(self) -> CompressionLevel {
        match self {
            Self::Full => CompressionLevel::None,
            Self::Compressed(level) => level,
        }
    }

    /// One step toward throughput.
    pub fn degrade(self) -> Self {
        match self.compression_level() {
            CompressionLevel::None => Self::Compressed(CompressionLevel::Fast),
            CompressionLevel::Fast | CompressionLevel::Lossless => Self::Compressed(CompressionLevel::Balanced),
            CompressionLevel::Balanced | CompressionLevel::Maximum => Self::Compressed(CompressionLevel::Maximum),
        }
    }

    /// One step toward fidelity.
    pub fn improve(self) -> Self {
        match self.compression_level() {
            CompressionLevel::Maximum => Self::Compressed(CompressionLevel::Balanced),
            CompressionLevel::Balanced => Self::Compressed(CompressionLevel::Fast),
            _ => Self::Full,
        }
    }

    /// Cache quality score for frames loaded at this level.
    pub fn score(self) -> f32 {
        match self.compression_level() {
            CompressionLevel::None | CompressionLevel::Lossless => 1.0,
            CompressionLevel::Fast => 0.8,
            CompressionLevel::Balanced => 0.6,
            CompressionLevel::Maximum => 0.4,
        }
    }
}

/// Streaming configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Byte budget for the read-ahead window.
    pub streaming_buffer_size: usize,
    pub read_ahead_frames: u32,
    /// Loader threads (0 = auto, capped at 4). Applied on the next start.
    pub max_concurrent_loads: usize,
    /// Window fill ratio below which quality steps down.
    pub load_threshold: f32,
    pub enable_adaptive_quality: bool,
    /// Follow the detected access pattern instead of a contiguous window.
    pub enable_predictive_loading: bool,
    /// Resident frames ahead of the playhead needed for a healthy buffer.
    pub min_safe_depth: u32,
    pub min_read_ahead_frames: u32,
    pub max_read_ahead_frames: u32,
    /// Per-frame decode budget; slower average loads degrade quality.
    pub target_frame_time_ms: f32,
    /// Spawn loader threads. When false, work runs through `process_pending`.
    pub background_loading: bool,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            streaming_buffer_size: 256 * 1024 * 1024,
            read_ahead_frames: 30,
            max_concurrent_loads: 4,
            load_threshold: 0.7,
            enable_adaptive_quality: true,
            enable_predictive_loading: true,
            min_safe_depth: 3,
            min_read_ahead_frames: 5,
            max_read_ahead_frames: 120,
            target_frame_time_ms: 33.3,
            background_loading: true,
        }
    }
}

impl StreamingConfig {
    /// Number of loader threads to spawn.
    pub fn loader_threads(&self) -> usize {
        StreamingTuning::from(self).loader_threads()
    }

    /// Read-ahead depth at `speed`.
    pub fn effective_read_ahead(&self, speed: f32) -> u32 {
        self.read_ahead_at(self.read_ahead_frames, speed)
    }

    fn read_ahead_at(&self, base: u32, speed: f32) -> u32 {
        let scaled = (base as f32 * speed.abs()).round() as u32;
        let upper = base.saturating_mul(4).min(self.max_read_ahead_frames);
        scaled.min(upper).max(self.min_read_ahead_frames)
    }
}

/// Runtime read-ahead and loader sizing.
///
/// Starts from the configured values and is then moved by
/// `adjust_cache_size_dynamically` and `optimize_for_playback_mode`. The
/// configuration itself is never rewritten by adaptation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StreamingTuning {
    pub read_ahead_frames: u32,
    pub max_concurrent_loads: usize,
}

impl From<&StreamingConfig> for StreamingTuning {
    fn from(config: &StreamingConfig) -> Self {
        Self {
            read_ahead_frames: config.read_ahead_frames,
            max_concurrent_loads: config.max_concurrent_loads,
        }
    }
}

impl StreamingTuning {
    /// `0` loads means one per core, at most four.
    pub fn loader_threads(&self) -> usize {
        if self.max_concurrent_loads == 0 {
            num_cpus::get().clamp(1, 4)
        } else {
            self.max_concurrent_loads
        }
    }
}

/// Per-session streaming statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StreamingStats {
    pub bytes_streamed: u64,
    pub frames_streamed: u64,
    /// Played frames that were resident.
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub average_load_time_ms: f32,
    /// Resident fraction of the read-ahead window.
    pub buffer_utilization: f32,
    pub is_underrun: bool,
    /// Consecutive resident frames from the playhead.
    pub buffer_depth: u32,
    pub frames_dropped: u64,
    pub load_errors: u64,
    pub quality: StreamQuality,
    pub read_ahead_frames: u32,
    pub is_streaming: bool,
}

#[derive(Debug, Clone, Copy)]
struct Job {
    frame: u32,
    epoch: u64,
}

struct Completed {
    frame: u32,
    epoch: u64,
    quality: StreamQuality,
    elapsed: Duration,
    result: Result<LoadedFrame, DeviceError>,
}

/// State shared with loader threads.
struct Shared {
    jobs: Mutex<VecDeque<Job>>,
    wake: Condvar,
    completed: Mutex<Vec<Completed>>,
    streaming: AtomicBool,
    epoch: AtomicU64,
    quality: Mutex<StreamQuality>,
}

#[derive(Default)]
struct Session {
    window: Vec<u32>,
    window_set: HashSet<u32>,
    /// Frames queued or in flight for the current epoch.
    pending: HashSet<u32>,
    /// Out-of-window frames requested explicitly.
    requested: HashSet<u32>,
    /// Frames this optimizer pinned in the cache.
    critical: HashSet<u32>,
    stats: StreamingStats,
    read_ahead: u32,
    speed: f32,
    reverse: bool,
    pressure: f32,
    avg_frame_bytes: usize,
}

/// Read-ahead streaming optimizer.
pub struct StreamingOptimizer {
    cache: Arc<IntelligentCache>,
    device: Arc<dyn GraphicsDevice>,
    loader: Arc<dyn FrameLoader>,
    config: RwLock<StreamingConfig>,
    tuning: Mutex<StreamingTuning>,
    analyzer: AccessPatternAnalyzer,
    playhead: AtomicU32,
    shared: Arc<Shared>,
    session: Mutex<Session>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl StreamingOptimizer {
    pub fn new(
        cache: Arc<IntelligentCache>,
        device: Arc<dyn GraphicsDevice>,
        loader: Arc<dyn FrameLoader>,
        config: StreamingConfig,
        pattern: PatternConfig,
    ) -> Self {
        let session = Session {
            read_ahead: config.effective_read_ahead(1.0),
            speed: 1.0,
            ..Session::default()
        };
        Self {
            cache,
            device,
            loader,
            tuning: Mutex::new(StreamingTuning::from(&config)),
            config: RwLock::new(config),
            analyzer: AccessPatternAnalyzer::new(pattern),
            playhead: AtomicU32::new(0),
            shared: Arc::new(Shared {
                jobs: Mutex::new(VecDeque::new()),
                wake: Condvar::new(),
                completed: Mutex::new(Vec::new()),
                streaming: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
                quality: Mutex::new(StreamQuality::Full),
            }),
            session: Mutex::new(session),
            workers: Mutex::new(Vec::new()),
        }
    }

    // ---- session control ----

    /// Start a session at `start_frame`, restarting any running one.
    pub fn start_streaming(&self, start_frame: u32) -> std::io::Result<()> {
        self.stop_streaming();
        self.join_workers();
        self.drain_completed();
        self.analyzer.reset();
        *self.shared.quality.lock() = StreamQuality::Full;

        let (threads, read_ahead) = {
            let config = self.config.read();
            let tuning = *self.tuning.lock();
            let threads = if config.background_loading {
                tuning.loader_threads()
            } else {
                0
            };
            (threads, config.read_ahead_at(tuning.read_ahead_frames, 1.0))
        };

        {
            let mut session = self.session.lock();
            let avg_frame_bytes = session.avg_frame_bytes;
            *session = Session {
                read_ahead,
                speed: 1.0,
                avg_frame_bytes,
                ..Session::default()
            };
            self.playhead.store(start_frame, Ordering::SeqCst);
            self.analyzer.record_access(start_frame);
            self.shared.streaming.store(true, Ordering::SeqCst);
            self.refill_locked(&mut session);
        }

        let mut workers = self.workers.lock();
        for id in 0..threads {
            let shared = self.shared.clone();
            let loader = self.loader.clone();
            let spawned = thread::Builder::new()
                .name(format!("vram-loader-{}", id))
                .spawn(move || loader_loop(shared, loader));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    drop(workers);
                    self.stop_streaming();
                    return Err(e);
                }
            }
        }

        tracing::info!(start_frame, loaders = threads, read_ahead, "Streaming started");
        Ok(())
    }

    /// Cancel queued work without waiting for in-flight loads.
    pub fn stop_streaming(&self) {
        if !self.shared.streaming.swap(false, Ordering::SeqCst) {
            return;
        }
        self.cancel_queued();

        let mut session = self.session.lock();
        self.release_critical(&mut session);
        session.pending.clear();
        session.requested.clear();
        session.window.clear();
        session.window_set.clear();
        tracing::info!(
            frames = session.stats.frames_streamed,
            dropped = session.stats.frames_dropped,
            "Streaming stopped"
        );
    }

    /// Jump the playhead. Queued and in-flight work becomes stale.
    pub fn seek_to_frame(&self, frame: u32) {
        self.playhead.store(frame, Ordering::SeqCst);
        if !self.is_streaming() {
            return;
        }
        self.cancel_queued();

        let mut session = self.session.lock();
        session.pending.clear();
        session.requested.clear();
        self.release_critical(&mut session);
        self.analyzer.reset();
        self.analyzer.record_access(frame);
        self.refill_locked(&mut session);
        self.prioritize_locked(&mut session);
        tracing::debug!(frame, "Seek");
    }

    /// Scale read-ahead with playback speed; negative speed streams backwards.
    pub fn set_playback_speed(&self, speed: f32) {
        if !speed.is_finite() {
            return;
        }
        let read_ahead = self.read_ahead_at(speed);
        let mut session = self.session.lock();
        session.speed = speed;
        if speed < 0.0 {
            session.reverse = true;
        } else if speed > 0.0 {
            session.reverse = false;
        }
        session.read_ahead = read_ahead;
        self.refill_locked(&mut session);
    }

    /// Advance the playhead during playback.
    pub fn on_frame_change(&self, frame: u32) {
        if !self.is_streaming() {
            return;
        }
        let hit = self.cache.contains(frame_texture_hash(frame));
        self.playhead.store(frame, Ordering::SeqCst);
        self.analyzer.record_access(frame);

        let mut session = self.session.lock();
        if hit {
            session.stats.cache_hits += 1;
        } else {
            session.stats.cache_misses += 1;
        }
        if !session.critical.is_empty() {
            self.prioritize_locked(&mut session);
        }
        self.refill_locked(&mut session);
    }

    /// Queue specific frames, such as preload requests from the cache.
    pub fn request_frames(&self, frames: &[u32]) -> usize {
        if !self.is_streaming() || frames.is_empty() {
            return 0;
        }
        let epoch = self.shared.epoch.load(Ordering::SeqCst);
        let mut session = self.session.lock();
        let mut jobs = self.shared.jobs.lock();
        let mut queued = 0;
        for &frame in frames {
            if session.pending.contains(&frame) || self.cache.contains(frame_texture_hash(frame)) {
                continue;
            }
            session.requested.insert(frame);
            session.window_set.insert(frame);
            session.pending.insert(frame);
            jobs.push_back(Job { frame, epoch });
            queued += 1;
        }
        drop(jobs);
        if queued > 0 {
            self.shared.wake.notify_all();
        }
        queued
    }

    // ---- completion path ----

    /// Move finished loads into the cache. Returns the number inserted.
    pub fn drain_completed(&self) -> usize {
        let completed = std::mem::take(&mut *self.shared.completed.lock());
        if completed.is_empty() {
            return 0;
        }

        let epoch = self.shared.epoch.load(Ordering::SeqCst);
        let mut session = self.session.lock();
        let mut inserted = 0;

        for done in completed {
            if done.epoch == epoch {
                session.pending.remove(&done.frame);
            }
            let loaded = match done.result {
                Ok(loaded) => loaded,
                Err(e) => {
                    session.stats.load_errors += 1;
                    tracing::warn!(frame = done.frame, error = %e, "Frame load failed");
                    continue;
                }
            };

            let elapsed_ms = done.elapsed.as_secs_f32() * 1000.0;
            session.stats.average_load_time_ms = if session.stats.frames_streamed == 0 {
                elapsed_ms
            } else {
                session.stats.average_load_time_ms * (1.0 - LOAD_TIME_ALPHA) + elapsed_ms * LOAD_TIME_ALPHA
            };
            session.avg_frame_bytes = if session.avg_frame_bytes == 0 {
                loaded.bytes
            } else {
                (session.avg_frame_bytes * 7 + loaded.bytes) / 8
            };

            if done.epoch != epoch || !session.window_set.contains(&done.frame) {
                self.discard(loaded.handle);
                session.stats.frames_dropped += 1;
                continue;
            }
            session.requested.remove(&done.frame);

            let handle = self.apply_quality(loaded.handle, done.quality);
            let hash = frame_texture_hash(done.frame);
            if !self
                .cache
                .put_texture_for_frame(hash, done.frame, handle, done.quality.score())
            {
                self.discard(handle);
                session.stats.frames_dropped += 1;
                continue;
            }

            session.stats.frames_streamed += 1;
            session.stats.bytes_streamed += loaded.bytes as u64;
            inserted += 1;
        }
        inserted
    }

    /// Run up to `max` queued loads on the calling thread, then drain.
    pub fn process_pending(&self, max: usize) -> usize {
        for _ in 0..max {
            let Some(job) = self.shared.jobs.lock().pop_front() else {
                break;
            };
            run_job(&self.shared, self.loader.as_ref(), job);
        }
        self.drain_completed()
    }

    fn apply_quality(&self, handle: TextureHandle, quality: StreamQuality) -> TextureHandle {
        let level = quality.compression_level();
        if level == CompressionLevel::None {
            return handle;
        }
        match self.cache.compression().compress_for_cache(handle, level) {
            Ok(compressed) => compressed,
            Err(e) => {
                tracing::debug!(%handle, ?level, error = %e, "Keeping raw frame");
                handle
            }
        }
    }

    fn discard(&self, handle: TextureHandle) {
        if let Err(e) = self.device.destroy_texture(handle) {
            tracing::warn!(%handle, error = %e, "Failed to destroy discarded frame");
        }
    }

    // ---- analysis ----

    /// Measure the window and adapt quality.
    pub fn analyze_access_patterns(&self) -> StreamingStats {
        let config = self.config.read().clone();
        let streaming = self.is_streaming();
        let mut session = self.session.lock();

        let (depth, utilization) = self.measure_locked(&session);
        let safe = config.min_safe_depth.min(session.window.len() as u32);
        let underrun = streaming && depth < safe;
        if underrun && !session.stats.is_underrun {
            tracing::warn!(
                depth,
                safe,
                playhead = self.playhead(),
                "Streaming buffer underrun"
            );
        }
        session.stats.buffer_depth = depth;
        session.stats.buffer_utilization = utilization;
        session.stats.is_underrun = underrun;

        if streaming && config.enable_adaptive_quality {
            let slow = session.stats.average_load_time_ms > config.target_frame_time_ms;
            let starving = utilization < config.load_threshold;
            let pressured = session.pressure >= CRITICAL_PRESSURE;
            if slow || starving || pressured {
                self.step_quality(StreamQuality::degrade);
            } else if !underrun && utilization >= OVERFULL_UTILIZATION {
                self.step_quality(StreamQuality::improve);
            }
        }

        self.snapshot_locked(&session)
    }

    /// Grow read-ahead on underrun, shrink it when the window is overfull.
    /// Returns the new read-ahead depth.
    pub fn adjust_cache_size_dynamically(&self) -> u32 {
        let stats = self.analyze_access_patterns();
        {
            let mut tuning = self.tuning.lock();
            let base = tuning.read_ahead_frames;
            if stats.is_underrun && base < GROW_LIMIT {
                tuning.read_ahead_frames = (base + GROW_STEP).min(GROW_LIMIT);
            } else if stats.buffer_utilization > OVERFULL_UTILIZATION && base > SHRINK_LIMIT {
                tuning.read_ahead_frames = base.saturating_sub(SHRINK_STEP).max(SHRINK_LIMIT);
            }
        }

        let mut session = self.session.lock();
        session.read_ahead = self.read_ahead_at(session.speed);
        if stats.is_underrun {
            self.prioritize_locked(&mut session);
        }
        self.refill_locked(&mut session);
        session.read_ahead
    }

    /// Pin resident frames near the playhead and unpin those that left the
    /// radius. Returns the number pinned.
    pub fn prioritize_critical_textures(&self) -> usize {
        let mut session = self.session.lock();
        self.prioritize_locked(&mut session)
    }

    /// Realtime playback favours depth; scrubbing favours responsiveness.
    /// The loader count applies on the next `start_streaming`.
    pub fn optimize_for_playback_mode(&self, is_realtime: bool) {
        let (read_ahead, loads) = if is_realtime { (30, 2) } else { (10, 4) };
        *self.tuning.lock() = StreamingTuning {
            read_ahead_frames: read_ahead,
            max_concurrent_loads: loads,
        };
        let mut session = self.session.lock();
        session.read_ahead = self.read_ahead_at(session.speed);
        self.refill_locked(&mut session);
        tracing::debug!(is_realtime, read_ahead, "Playback mode applied");
    }

    /// Forward VRAM pressure. Critical pressure steps quality down.
    pub fn set_memory_pressure(&self, pressure: f32) {
        let pressure = if pressure.is_finite() {
            pressure.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self.session.lock().pressure = pressure;
        if pressure >= CRITICAL_PRESSURE && self.config.read().enable_adaptive_quality {
            self.step_quality(StreamQuality::degrade);
        }
    }

    pub fn quality(&self) -> StreamQuality {
        *self.shared.quality.lock()
    }

    fn step_quality(&self, step: fn(StreamQuality) -> StreamQuality) {
        let mut quality = self.shared.quality.lock();
        let next = step(*quality);
        if next != *quality {
            tracing::info!(from = ?*quality, to = ?next, "Stream quality changed");
            *quality = next;
        }
    }

    // ---- config and stats ----

    pub fn get_config(&self) -> StreamingConfig {
        self.config.read().clone()
    }

    /// Replace the configuration. Adapted sizing is kept unless the new
    /// configuration changes the sizing fields themselves.
    pub fn update_config(&self, config: StreamingConfig) {
        {
            let previous = self.config.read();
            if StreamingTuning::from(&*previous) != StreamingTuning::from(&config) {
                *self.tuning.lock() = StreamingTuning::from(&config);
            }
        }
        *self.config.write() = config;
        let mut session = self.session.lock();
        session.read_ahead = self.read_ahead_at(session.speed);
        self.refill_locked(&mut session);
    }

    /// Current adapted sizing.
    pub fn tuning(&self) -> StreamingTuning {
        *self.tuning.lock()
    }

    fn read_ahead_at(&self, speed: f32) -> u32 {
        let base = self.tuning.lock().read_ahead_frames;
        self.config.read().read_ahead_at(base, speed)
    }

    pub fn get_statistics(&self) -> StreamingStats {
        let session = self.session.lock();
        self.snapshot_locked(&session)
    }

    /// False when the resident depth ahead of the playhead is below
    /// `min_safe_depth`.
    pub fn is_buffer_healthy(&self) -> bool {
        if !self.is_streaming() {
            return true;
        }
        let min_safe = self.config.read().min_safe_depth;
        let session = self.session.lock();
        let (depth, _) = self.measure_locked(&session);
        depth >= min_safe.min(session.window.len() as u32)
    }

    pub fn is_streaming(&self) -> bool {
        self.shared.streaming.load(Ordering::SeqCst)
    }

    pub fn playhead(&self) -> u32 {
        self.playhead.load(Ordering::SeqCst)
    }

    /// Frames in the current read-ahead window, playhead first.
    pub fn window(&self) -> Vec<u32> {
        self.session.lock().window.clone()
    }

    pub fn queued_loads(&self) -> usize {
        self.shared.jobs.lock().len()
    }

    /// Stop, join loader threads and destroy undelivered loads.
    pub fn shutdown(&self) {
        self.stop_streaming();
        self.join_workers();
        self.drain_completed();
    }

    // ---- internals ----

    fn cancel_queued(&self) {
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
        self.shared.jobs.lock().clear();
        self.shared.wake.notify_all();
    }

    fn join_workers(&self) {
        let handles = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("Loader thread panicked");
            }
        }
    }

    fn snapshot_locked(&self, session: &Session) -> StreamingStats {
        StreamingStats {
            quality: self.quality(),
            read_ahead_frames: session.read_ahead,
            is_streaming: self.is_streaming(),
            ..session.stats.clone()
        }
    }

    /// Consecutive resident depth and resident fraction of the window.
    fn measure_locked(&self, session: &Session) -> (u32, f32) {
        if session.window.is_empty() {
            return (0, 0.0);
        }
        let mut depth = 0;
        let mut resident = 0;
        let mut contiguous = true;
        for &frame in &session.window {
            if self.cache.contains(frame_texture_hash(frame)) {
                resident += 1;
                if contiguous {
                    depth += 1;
                }
            } else {
                contiguous = false;
            }
        }
        (depth, resident as f32 / session.window.len() as f32)
    }

    fn plan_window(&self, session: &Session, config: &StreamingConfig) -> Vec<u32> {
        let playhead = self.playhead();
        let mut depth = session.read_ahead.max(1) as usize;
        if session.avg_frame_bytes > 0 {
            depth = depth.min((config.streaming_buffer_size / session.avg_frame_bytes).max(1));
        }

        let mut window = Vec::with_capacity(depth);
        window.push(playhead);
        let predicted = if config.enable_predictive_loading && self.analyzer.prefetch_enabled() {
            self.analyzer.predicted_frames(depth - 1)
        } else {
            Vec::new()
        };

        if predicted.is_empty() {
            for i in 1..depth as u32 {
                let next = if session.reverse {
                    playhead.checked_sub(i)
                } else {
                    playhead.checked_add(i)
                };
                match next {
                    Some(frame) => window.push(frame),
                    None => break,
                }
            }
        } else {
            window.extend(predicted.into_iter().filter(|&frame| frame != playhead));
        }
        window
    }

    /// Recompute the window, drop queued jobs outside it and queue missing
    /// frames nearest first.
    fn refill_locked(&self, session: &mut Session) {
        if !self.is_streaming() {
            return;
        }
        let window = {
            let config = self.config.read();
            self.plan_window(session, &config)
        };
        session.window_set = window.iter().chain(session.requested.iter()).copied().collect();
        session.window = window;

        let epoch = self.shared.epoch.load(Ordering::SeqCst);
        let mut jobs = self.shared.jobs.lock();
        let mut cancelled = Vec::new();
        jobs.retain(|job| {
            let keep = session.window_set.contains(&job.frame);
            if !keep {
                cancelled.push(job.frame);
            }
            keep
        });
        for frame in &cancelled {
            session.pending.remove(frame);
        }

        let limit = session.window.len() + session.requested.len();
        let mut queued = 0;
        for &frame in &session.window {
            if jobs.len() >= limit {
                break;
            }
            if session.pending.contains(&frame) || self.cache.contains(frame_texture_hash(frame)) {
                continue;
            }
            jobs.push_back(Job { frame, epoch });
            session.pending.insert(frame);
            queued += 1;
        }
        drop(jobs);

        if queued > 0 {
            self.shared.wake.notify_all();
        }
    }

    fn prioritize_locked(&self, session: &mut Session) -> usize {
        let playhead = self.playhead();
        let lo = playhead.saturating_sub(CRITICAL_RADIUS);
        let hi = playhead.saturating_add(CRITICAL_RADIUS);

        let previous = std::mem::take(&mut session.critical);
        for frame in lo..=hi {
            if self.cache.mark_critical(frame_texture_hash(frame), true) {
                session.critical.insert(frame);
            }
        }
        for frame in previous {
            if !session.critical.contains(&frame) {
                self.cache.mark_critical(frame_texture_hash(frame), false);
            }
        }
        session.critical.len()
    }

    fn release_critical(&self, session: &mut Session) {
        for frame in session.critical.drain() {
            self.cache.mark_critical(frame_texture_hash(frame), false);
        }
    }
}

impl Drop for StreamingOptimizer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn loader_loop(shared: Arc<Shared>, loader: Arc<dyn FrameLoader>) {
    loop {
        let job = {
            let mut jobs = shared.jobs.lock();
            loop {
                if !shared.streaming.load(Ordering::SeqCst) {
                    return;
                }
                if let Some(job) = jobs.pop_front() {
                    break job;
                }
                shared.wake.wait_for(&mut jobs, IDLE_WAIT);
            }
        };
        run_job(&shared, loader.as_ref(), job);
    }
}

fn run_job(shared: &Shared, loader: &dyn FrameLoader, job: Job) {
    if job.epoch != shared.epoch.load(Ordering::SeqCst) {
        return;
    }
    let quality = *shared.quality.lock();
    let start = Instant::now();
    let result = match catch_unwind(AssertUnwindSafe(|| loader.load_frame(job.frame, quality))) {
        Ok(result) => result,
        Err(_) => {
            tracing::error!(frame = job.frame, "Frame loader panicked");
            Err(DeviceError::OperationFailed("frame loader panicked".to_string()))
        }
    };
    shared.completed.lock().push(Completed {
        frame: job.frame,
        epoch: job.epoch,
        quality,
        elapsed: start.elapsed(),
        result,
    });
}

#[cfg(test)]
#[path = "streaming_tests.rs"]
mod tests;
