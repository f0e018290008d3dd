// Copyright 2024-2026 VRAM-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! VRAM pressure monitoring.
//!
//! Samples device counters, classifies usage into a [`PressureLevel`] and
//! drives cache cleanup. Pressure is the raw usage ratio; optional
//! hysteresis only delays downward level transitions.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::cache::IntelligentCache;
use crate::device::{DeviceMemoryInfo, GraphicsDevice};

const MIB: usize = 1024 * 1024;
/// Minimum pressure movement reported to `on_pressure_changed`.
const PRESSURE_REPORT_DELTA: f32 = 0.05;

/// Usage ratio thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub warning_threshold: f32,
    pub critical_threshold: f32,
    pub cleanup_threshold: f32,
    /// Free VRAM below this triggers eviction of the shortfall.
    pub min_free_bytes: usize,
    /// Usage must drop this far below a threshold before the level falls.
    pub hysteresis: f32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            warning_threshold: 0.75,
            critical_threshold: 0.90,
            cleanup_threshold: 0.85,
            min_free_bytes: 128 * MIB,
            hysteresis: 0.0,
        }
    }
}

impl Thresholds {
    fn classify(&self, usage: f32) -> PressureLevel {
        if usage >= self.critical_threshold {
            PressureLevel::Critical
        } else if usage >= self.cleanup_threshold {
            PressureLevel::Cleanup
        } else if usage >= self.warning_threshold {
            PressureLevel::Warning
        } else {
            PressureLevel::Normal
        }
    }
}

/// Pressure classification, ordered by severity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PressureLevel {
    #[default]
    Normal,
    Warning,
    Cleanup,
    Critical,
}

/// Snapshot of device memory.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VramStatus {
    pub total_vram: usize,
    pub used_vram: usize,
    pub available_vram: usize,
    /// Headroom held back for other consumers.
    pub reserved_vram: usize,
    pub allocation_count: usize,
    pub fragmentation_ratio: f32,
    pub memory_pressure: f32,
    pub level: PressureLevel,
}

impl VramStatus {
    pub fn usage_ratio(&self) -> f32 {
        if self.total_vram == 0 {
            0.0
        } else {
            self.used_vram as f32 / self.total_vram as f32
        }
    }
}

/// What `trigger_cleanup_if_needed` did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupOutcome {
    pub level: PressureLevel,
    pub freed_bytes: usize,
    /// Bytes missing from `min_free_bytes` before cleanup.
    pub min_free_shortfall: usize,
}

/// Fragmentation heuristic from usage ratio and live allocation count.
pub fn estimate_fragmentation(usage_ratio: f32, allocations: usize) -> f32 {
    if usage_ratio > 0.7 && allocations > 1000 {
        (usage_ratio * 0.3).min(0.5)
    } else {
        usage_ratio * 0.1
    }
}

pub type PressureCallback = Arc<dyn Fn(f32) + Send + Sync>;
pub type StatusCallback = Arc<dyn Fn(&VramStatus) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    pressure_changed: Option<PressureCallback>,
    warning: Option<StatusCallback>,
    critical: Option<StatusCallback>,
}

/// VRAM monitor.
pub struct VramMonitor {
    thresholds: RwLock<Thresholds>,
    status: RwLock<VramStatus>,
    last_reported: Mutex<Option<f32>>,
    callbacks: RwLock<Callbacks>,
}

impl VramMonitor {
    pub fn new(thresholds: Thresholds) -> Self {
        Self {
            thresholds: RwLock::new(thresholds),
            status: RwLock::new(VramStatus::default()),
            last_reported: Mutex::new(None),
            callbacks: RwLock::new(Callbacks::default()),
        }
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds.read().clone()
    }

    pub fn set_thresholds(&self, thresholds: Thresholds) {
        *self.thresholds.write() = thresholds;
    }

    pub fn on_pressure_changed(&self, callback: impl Fn(f32) + Send + Sync + 'static) {
        self.callbacks.write().pressure_changed = Some(Arc::new(callback));
    }

    pub fn on_memory_warning(&self, callback: impl Fn(&VramStatus) + Send + Sync + 'static) {
        self.callbacks.write().warning = Some(Arc::new(callback));
    }

    pub fn on_memory_critical(&self, callback: impl Fn(&VramStatus) + Send + Sync + 'static) {
        self.callbacks.write().critical = Some(Arc::new(callback));
    }

    /// Sample the device and fire callbacks.
    pub fn update_from_device(&self, device: &dyn GraphicsDevice) -> VramStatus {
        self.update_from_info(device.memory_info())
    }

    /// Update from raw counters.
    pub fn update_from_info(&self, info: DeviceMemoryInfo) -> VramStatus {
        let thresholds = self.thresholds();
        let total = info.total;
        let used = info.used.min(total);
        let available = info.available.min(total - used);
        let usage = if total > 0 { used as f32 / total as f32 } else { 0.0 };

        let status = {
            let mut status = self.status.write();
            let raw = thresholds.classify(usage);
            let level = if raw < status.level {
                thresholds.classify(usage + thresholds.hysteresis.max(0.0)).min(status.level)
            } else {
                raw
            };
            if level != status.level {
                match level {
                    PressureLevel::Normal => tracing::info!(usage, "VRAM pressure back to normal"),
                    PressureLevel::Warning => tracing::info!(usage, "VRAM usage above warning threshold"),
                    PressureLevel::Cleanup => tracing::warn!(usage, "VRAM usage above cleanup threshold"),
                    PressureLevel::Critical => tracing::warn!(usage, "VRAM usage critical"),
                }
            }
            *status = VramStatus {
                total_vram: total,
                used_vram: used,
                available_vram: available,
                reserved_vram: thresholds.min_free_bytes.min(total),
                allocation_count: info.allocation_count,
                fragmentation_ratio: estimate_fragmentation(usage, info.allocation_count),
                memory_pressure: usage.clamp(0.0, 1.0),
                level,
            };
            status.clone()
        };

        self.fire_callbacks(&status);
        status
    }

    fn fire_callbacks(&self, status: &VramStatus) {
        let (pressure_cb, warning_cb, critical_cb) = {
            let cbs = self.callbacks.read();
            (cbs.pressure_changed.clone(), cbs.warning.clone(), cbs.critical.clone())
        };

        let pressure = status.memory_pressure;
        let report = {
            let mut last = self.last_reported.lock();
            let moved = last.map_or(true, |prev| (pressure - prev).abs() > PRESSURE_REPORT_DELTA);
            if moved {
                *last = Some(pressure);
            }
            moved
        };
        if report {
            if let Some(cb) = pressure_cb {
                invoke("pressure_changed", || cb(pressure));
            }
        }

        match status.level {
            PressureLevel::Warning | PressureLevel::Cleanup => {
                if let Some(cb) = warning_cb {
                    invoke("memory_warning", || cb(status));
                }
            }
            PressureLevel::Critical => {
                if let Some(cb) = critical_cb {
                    invoke("memory_critical", || cb(status));
                }
            }
            PressureLevel::Normal => {}
        }
    }

    /// Apply the cleanup the current level calls for.
    pub fn trigger_cleanup_if_needed(&self, cache: &IntelligentCache) -> CleanupOutcome {
        let status = self.get_status();
        let min_free = self.thresholds.read().min_free_bytes;
        let mut outcome = CleanupOutcome {
            level: status.level,
            ..CleanupOutcome::default()
        };

        match status.level {
            PressureLevel::Cleanup => {
                outcome.freed_bytes += cache.force_cleanup();
            }
            PressureLevel::Critical => {
                outcome.freed_bytes += cache.purge_evictable();
                cache.set_memory_pressure(1.0);
            }
            PressureLevel::Normal | PressureLevel::Warning => {}
        }

        if status.total_vram > 0 && status.available_vram < min_free {
            // Bytes already released above count toward the shortfall.
            outcome.min_free_shortfall = min_free - status.available_vram;
            let remaining = outcome.min_free_shortfall.saturating_sub(outcome.freed_bytes);
            if remaining > 0 {
                outcome.freed_bytes += cache.free_memory(remaining);
            }
        }

        if outcome.freed_bytes > 0 {
            tracing::info!(
                level = ?outcome.level,
                freed = outcome.freed_bytes,
                shortfall = outcome.min_free_shortfall,
                "Pressure cleanup"
            );
        }
        outcome
    }

    pub fn calculate_fragmentation(&self) -> f32 {
        let status = self.status.read();
        estimate_fragmentation(status.usage_ratio(), status.allocation_count)
    }

    /// True when `bytes` fit while keeping `min_free_bytes` free.
    pub fn is_memory_available(&self, bytes: usize) -> bool {
        let min_free = self.thresholds.read().min_free_bytes;
        self.status.read().available_vram >= bytes.saturating_add(min_free)
    }

    pub fn get_usage_ratio(&self) -> f32 {
        self.status.read().usage_ratio()
    }

    pub fn get_status(&self) -> VramStatus {
        self.status.read().clone()
    }

    pub fn level(&self) -> PressureLevel {
        self.status.read().level
    }
}

fn invoke(name: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        tracing::error!(callback = name, "Monitor callback panicked");
    }
}
