// Copyright 2024-2026 VRAM-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! GPU memory optimizer: composition root for the cache, streaming and
//! pressure monitoring.
//!
//! The optimizer is an explicitly owned value. Its monitoring thread holds a
//! weak reference to the shared state, so dropping the optimizer stops every
//! thread it started.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::{IntelligentCache, MemoryStats, TextureLease};
use crate::compression::{CompressionLevel, TextureCompression};
use crate::config::{ConfigError, OptimizerConfig};
use crate::device::{GraphicsDevice, TextureHandle};
use crate::monitor::{PressureLevel, VramMonitor, VramStatus};
use crate::pattern::PatternType;
use crate::streaming::{FrameLoader, StreamingOptimizer, StreamingStats};
use crate::telemetry::{metrics, TelemetrySnapshot};
use crate::worker::PeriodicWorker;

#[derive(Debug, Error)]
pub enum OptimizerError {
    #[error("unknown workflow: {0}")]
    UnknownWorkflow(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to spawn background thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Editing workflows with tuned presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Workflow {
    RealtimePlayback,
    Scrubbing,
    ExportRendering,
}

impl Workflow {
    pub fn as_str(self) -> &'static str {
        match self {
            Workflow::RealtimePlayback => "realtime_playback",
            Workflow::Scrubbing => "scrubbing",
            Workflow::ExportRendering => "export_rendering",
        }
    }

    /// Derive the preset configuration from `base`.
    pub fn apply(self, base: &OptimizerConfig) -> OptimizerConfig {
        let mut config = base.clone();
        match self {
            Workflow::RealtimePlayback => {
                config.cache.eviction_threshold = 0.9;
                config.cache.enable_prediction = true;
                config.streaming.read_ahead_frames = 30;
                config.streaming.max_concurrent_loads = 2;
                config.compression.background_level = CompressionLevel::Fast;
            }
            Workflow::Scrubbing => {
                config.cache.eviction_threshold = 0.85;
                config.streaming.read_ahead_frames = 10;
                config.streaming.max_concurrent_loads = 4;
                config.compression.background_level = CompressionLevel::Balanced;
            }
            Workflow::ExportRendering => {
                config.cache.eviction_threshold = 0.7;
                config.cache.enable_prediction = false;
                config.streaming.read_ahead_frames = 10;
                config.streaming.max_concurrent_loads = 4;
                config.compression.background_level = CompressionLevel::Maximum;
                config.compression.min_idle_ms = config.compression.min_idle_ms.min(1_000);
            }
        }
        config.streaming.read_ahead_frames = config
            .streaming
            .read_ahead_frames
            .clamp(config.streaming.min_read_ahead_frames.max(1), config.streaming.max_read_ahead_frames.max(1));
        config
    }

    fn is_realtime(self) -> bool {
        self == Workflow::RealtimePlayback
    }
}

impl FromStr for Workflow {
    type Err = OptimizerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "realtime_playback" | "realtime" | "playback" => Ok(Workflow::RealtimePlayback),
            "scrubbing" | "scrub" => Ok(Workflow::Scrubbing),
            "export_rendering" | "export" | "rendering" | "render" => Ok(Workflow::ExportRendering),
            _ => Err(OptimizerError::UnknownWorkflow(s.to_string())),
        }
    }
}

/// State shared with the monitoring thread.
struct Inner {
    device: Arc<dyn GraphicsDevice>,
    compression: Arc<TextureCompression>,
    cache: Arc<IntelligentCache>,
    streaming: StreamingOptimizer,
    monitor: VramMonitor,
    config: ArcSwap<OptimizerConfig>,
    /// Playback mode last pushed to streaming (true = realtime).
    playback_mode: Mutex<Option<bool>>,
    ticks: AtomicU64,
}

impl Inner {
    /// One monitoring pass.
    fn tick(&self) -> VramStatus {
        let config = self.config.load();
        let status = self.monitor.update_from_device(self.device.as_ref());

        self.cache.set_memory_pressure(cache_pressure(&status, config.thresholds.warning_threshold));
        let outcome = self.monitor.trigger_cleanup_if_needed(&self.cache);
        self.streaming.set_memory_pressure(if status.level == PressureLevel::Critical {
            1.0
        } else {
            status.memory_pressure
        });

        if !self.cache.is_background_running() {
            self.cache.run_optimization_pass();
        }

        let requests = self.cache.take_preload_requests();
        if !requests.is_empty() {
            self.streaming.request_frames(&requests);
        }
        self.streaming.drain_completed();
        if self.streaming.is_streaming() {
            self.streaming.adjust_cache_size_dynamically();
        }
        self.adapt_playback_mode();

        if config.enable_telemetry {
            metrics::record_vram(&status);
            metrics::record_memory(&self.cache.get_statistics());
            metrics::record_streaming(&self.streaming.get_statistics());
            metrics::record_cleanup(&outcome);
        }
        self.ticks.fetch_add(1, Ordering::Relaxed);
        status
    }

    /// Sequential access switches streaming to realtime mode, bursts to
    /// scrubbing mode. Other patterns leave the current mode.
    fn adapt_playback_mode(&self) {
        let realtime = match self.cache.current_pattern().pattern_type {
            PatternType::Sequential => true,
            PatternType::Burst => false,
            PatternType::Random | PatternType::Predictable => return,
        };
        let mut mode = self.playback_mode.lock();
        if *mode != Some(realtime) {
            *mode = Some(realtime);
            self.streaming.optimize_for_playback_mode(realtime);
            tracing::debug!(realtime, "Streaming mode follows access pattern");
        }
    }

    fn apply_config(&self, config: &OptimizerConfig) {
        self.cache.update_config(config.cache.clone());
        self.compression.set_policy(config.compression.clone());
        self.streaming.update_config(config.streaming.clone());
        self.monitor.set_thresholds(config.thresholds.clone());
    }
}

/// Excess usage above the warning threshold, normalized to `0..=1`.
fn cache_pressure(status: &VramStatus, warning: f32) -> f32 {
    if warning >= 1.0 {
        return 0.0;
    }
    ((status.memory_pressure - warning) / (1.0 - warning)).clamp(0.0, 1.0)
}

/// GPU memory optimizer.
pub struct GpuMemoryOptimizer {
    inner: Arc<Inner>,
    monitor_worker: Mutex<Option<PeriodicWorker>>,
}

impl GpuMemoryOptimizer {
    /// Build all components and start background threads when enabled.
    ///
    /// Pattern settings are fixed at construction.
    pub fn new(
        device: Arc<dyn GraphicsDevice>,
        loader: Arc<dyn FrameLoader>,
        config: OptimizerConfig,
    ) -> Result<Self, OptimizerError> {
        config.validate()?;

        let compression = Arc::new(TextureCompression::new(device.clone(), config.compression.clone()));
        let cache = Arc::new(IntelligentCache::new(
            device.clone(),
            compression.clone(),
            config.cache.clone(),
            config.pattern.clone(),
        ));
        let streaming = StreamingOptimizer::new(
            cache.clone(),
            device.clone(),
            loader,
            config.streaming.clone(),
            config.pattern.clone(),
        );
        let monitor = VramMonitor::new(config.thresholds.clone());
        monitor.update_from_device(device.as_ref());

        let optimizer = Self {
            inner: Arc::new(Inner {
                device,
                compression,
                cache,
                streaming,
                monitor,
                config: ArcSwap::from_pointee(config.clone()),
                playback_mode: Mutex::new(None),
                ticks: AtomicU64::new(0),
            }),
            monitor_worker: Mutex::new(None),
        };
        optimizer.start_workers(&config)?;

        tracing::info!(
            max_cache_size = config.cache.max_cache_size,
            background = config.enable_background_optimization,
            interval_ms = config.optimization_interval_ms,
            "GPU memory optimizer started"
        );
        Ok(optimizer)
    }

    // ---- texture access ----

    pub fn get_texture(&self, hash: u64) -> Option<TextureHandle> {
        self.inner.cache.get_texture(hash)
    }

    /// Pin a texture for the lifetime of the returned lease.
    pub fn acquire_texture(&self, hash: u64) -> Option<TextureLease> {
        self.inner.cache.acquire_texture(hash)
    }

    /// Hand a texture to the cache. On false the caller keeps ownership.
    pub fn cache_texture(&self, hash: u64, handle: TextureHandle, quality: f32) -> bool {
        self.inner.cache.put_texture(hash, handle, quality)
    }

    pub fn notify_frame_change(&self, frame: u32) {
        self.inner.cache.notify_frame_access(frame);
        self.inner.streaming.on_frame_change(frame);
    }

    // ---- streaming pass-throughs ----

    pub fn start_streaming(&self, start_frame: u32) -> Result<(), OptimizerError> {
        self.inner.cache.notify_frame_access(start_frame);
        self.inner.streaming.start_streaming(start_frame)?;
        Ok(())
    }

    pub fn stop_streaming(&self) {
        self.inner.streaming.stop_streaming();
    }

    /// Jump the playhead. Treated as a pattern discontinuity.
    pub fn seek_to_frame(&self, frame: u32) {
        self.inner.cache.reset_access_pattern();
        self.inner.cache.notify_frame_access(frame);
        self.inner.streaming.seek_to_frame(frame);
    }

    pub fn set_playback_speed(&self, speed: f32) {
        self.inner.streaming.set_playback_speed(speed);
    }

    // ---- memory management ----

    /// Make sure `bytes` of device memory are available, evicting cache
    /// entries for the shortfall.
    pub fn ensure_memory_available(&self, bytes: usize) -> bool {
        let status = self.inner.monitor.update_from_device(self.inner.device.as_ref());
        if status.available_vram >= bytes {
            return true;
        }

        let freed = self.inner.cache.free_memory(bytes - status.available_vram);
        let status = self.inner.monitor.update_from_device(self.inner.device.as_ref());
        let ok = status.available_vram >= bytes;
        if !ok {
            tracing::warn!(
                requested = bytes,
                available = status.available_vram,
                freed,
                "Unable to make requested memory available"
            );
        }
        ok
    }

    /// Aggressive cleanup. Returns bytes freed.
    pub fn force_memory_cleanup(&self) -> usize {
        let freed = self.inner.cache.force_cleanup() + self.inner.cache.trigger_garbage_collection();
        self.inner.monitor.update_from_device(self.inner.device.as_ref());
        tracing::info!(freed, "Forced memory cleanup");
        freed
    }

    /// Called when pressure moves by more than 0.05. Panics are contained.
    pub fn set_memory_pressure_callback(&self, callback: impl Fn(f32) + Send + Sync + 'static) {
        self.inner.monitor.on_pressure_changed(callback);
    }

    pub fn on_memory_warning(&self, callback: impl Fn(&VramStatus) + Send + Sync + 'static) {
        self.inner.monitor.on_memory_warning(callback);
    }

    pub fn on_memory_critical(&self, callback: impl Fn(&VramStatus) + Send + Sync + 'static) {
        self.inner.monitor.on_memory_critical(callback);
    }

    /// Run one monitoring pass on the calling thread.
    pub fn poll(&self) -> VramStatus {
        self.inner.tick()
    }

    // ---- workflow and configuration ----

    /// Apply a named preset. Accepts `realtime_playback`, `scrubbing` and
    /// `export_rendering` (plus short aliases).
    pub fn optimize_for_workflow(&self, name: &str) -> Result<Workflow, OptimizerError> {
        let workflow: Workflow = name.parse()?;
        let config = workflow.apply(&self.inner.config.load());
        self.update_configuration(config)?;

        *self.inner.playback_mode.lock() = Some(workflow.is_realtime());
        self.inner.streaming.optimize_for_playback_mode(workflow.is_realtime());
        match workflow {
            Workflow::RealtimePlayback => {}
            Workflow::Scrubbing => {
                self.inner.cache.trigger_garbage_collection();
            }
            Workflow::ExportRendering => {
                self.inner.cache.trigger_garbage_collection();
                self.inner.cache.force_cleanup();
            }
        }

        tracing::info!(workflow = workflow.as_str(), "Workflow preset applied");
        Ok(workflow)
    }

    /// Validate and atomically replace the whole configuration.
    pub fn update_configuration(&self, config: OptimizerConfig) -> Result<(), OptimizerError> {
        config.validate()?;
        let previous = self.inner.config.swap(Arc::new(config.clone()));
        self.inner.apply_config(&config);

        let restart = previous.enable_background_optimization != config.enable_background_optimization
            || previous.optimization_interval_ms != config.optimization_interval_ms
            || previous.cache.background_interval_ms != config.cache.background_interval_ms;
        if restart {
            self.stop_workers();
            self.start_workers(&config)?;
        }
        tracing::debug!(restart, "Configuration replaced");
        Ok(())
    }

    pub fn get_configuration(&self) -> OptimizerConfig {
        OptimizerConfig::clone(&self.inner.config.load())
    }

    // ---- statistics ----

    pub fn get_memory_statistics(&self) -> MemoryStats {
        self.inner.cache.get_statistics()
    }

    pub fn get_streaming_statistics(&self) -> StreamingStats {
        self.inner.streaming.get_statistics()
    }

    pub fn get_vram_status(&self) -> VramStatus {
        self.inner.monitor.get_status()
    }

    pub fn telemetry_snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            timestamp: Utc::now(),
            memory: self.get_memory_statistics(),
            streaming: self.get_streaming_statistics(),
            vram: self.get_vram_status(),
            access_pattern: self.inner.cache.current_pattern(),
            compression: self.inner.compression.stats(),
        }
    }

    /// Completed monitoring passes.
    pub fn ticks(&self) -> u64 {
        self.inner.ticks.load(Ordering::Relaxed)
    }

    pub fn cache(&self) -> &Arc<IntelligentCache> {
        &self.inner.cache
    }

    pub fn streaming(&self) -> &StreamingOptimizer {
        &self.inner.streaming
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor_worker.lock().is_some()
    }

    /// Stop every background thread. Resident textures stay cached until
    /// the optimizer is dropped.
    pub fn shutdown(&self) {
        self.stop_workers();
        self.inner.streaming.shutdown();
    }

    fn start_workers(&self, config: &OptimizerConfig) -> Result<(), OptimizerError> {
        if !config.enable_background_optimization {
            return Ok(());
        }
        self.inner.cache.start_background(config.cache.background_interval())?;
        let worker = PeriodicWorker::spawn(
            "vram-monitor",
            config.optimization_interval(),
            Arc::downgrade(&self.inner),
            |inner: &Inner| {
                inner.tick();
            },
        );
        match worker {
            Ok(worker) => {
                *self.monitor_worker.lock() = Some(worker);
                Ok(())
            }
            Err(e) => {
                self.inner.cache.stop_background();
                Err(e.into())
            }
        }
    }

    fn stop_workers(&self) {
        let worker = self.monitor_worker.lock().take();
        if let Some(worker) = worker {
            worker.stop();
        }
        self.inner.cache.stop_background();
    }
}

impl Drop for GpuMemoryOptimizer {
    fn drop(&mut self) {
        self.shutdown();
        tracing::info!("GPU memory optimizer stopped");
    }
}
