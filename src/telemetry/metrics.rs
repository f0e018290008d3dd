//! Metrics facade wiring.
//!
//! Values go through the `metrics` crate macros; without an installed
//! recorder they are no-ops. Cumulative counters are published as absolute
//! values taken from the stats snapshots.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};

use crate::cache::MemoryStats;
use crate::monitor::{CleanupOutcome, PressureLevel, VramStatus};
use crate::streaming::StreamingStats;

/// Register metric descriptions. Call once after installing a recorder.
pub fn init_metrics() {
    describe_gauge!("vram_pressure", Unit::Percent, "Device memory usage ratio");
    describe_gauge!("vram_used_bytes", Unit::Bytes, "Device memory in use");
    describe_gauge!("vram_available_bytes", Unit::Bytes, "Device memory available");
    describe_gauge!("vram_fragmentation", "Estimated fragmentation ratio");
    describe_gauge!("vram_pressure_level", "Pressure level (0 normal .. 3 critical)");
    describe_gauge!("cache_resident_bytes", Unit::Bytes, "Bytes held by the texture cache");
    describe_gauge!("cache_compressed_bytes", Unit::Bytes, "Bytes held by compressed entries");
    describe_gauge!("cache_entries", Unit::Count, "Resident cache entries");
    describe_gauge!("cache_hit_ratio", "Cache hit ratio");
    describe_counter!("cache_evictions_total", Unit::Count, "Entries evicted");
    describe_counter!("cache_rejected_inserts_total", Unit::Count, "Inserts refused");
    describe_counter!("stream_frames_total", Unit::Count, "Frames streamed into the cache");
    describe_counter!("stream_frames_dropped_total", Unit::Count, "Loaded frames discarded");
    describe_gauge!("stream_buffer_utilization", "Resident fraction of the read-ahead window");
    describe_gauge!("stream_buffer_depth", Unit::Count, "Resident frames ahead of the playhead");
    describe_histogram!("stream_load_time_ms", Unit::Milliseconds, "Average frame load time");
    describe_counter!("vram_cleanup_freed_bytes_total", Unit::Bytes, "Bytes freed by pressure cleanup");
}

pub fn record_vram(status: &VramStatus) {
    gauge!("vram_pressure").set(status.memory_pressure as f64);
    gauge!("vram_used_bytes").set(status.used_vram as f64);
    gauge!("vram_available_bytes").set(status.available_vram as f64);
    gauge!("vram_fragmentation").set(status.fragmentation_ratio as f64);
    let level = match status.level {
        PressureLevel::Normal => 0.0,
        PressureLevel::Warning => 1.0,
        PressureLevel::Cleanup => 2.0,
        PressureLevel::Critical => 3.0,
    };
    gauge!("vram_pressure_level").set(level);
}

pub fn record_memory(stats: &MemoryStats) {
    gauge!("cache_resident_bytes").set(stats.cached_memory as f64);
    gauge!("cache_compressed_bytes").set(stats.compressed_memory as f64);
    gauge!("cache_entries").set(stats.cache_entries as f64);
    gauge!("cache_hit_ratio").set(stats.hit_ratio as f64);
    counter!("cache_evictions_total").absolute(stats.evictions);
    counter!("cache_rejected_inserts_total").absolute(stats.rejected_inserts);
}

pub fn record_streaming(stats: &StreamingStats) {
    counter!("stream_frames_total").absolute(stats.frames_streamed);
    counter!("stream_frames_dropped_total").absolute(stats.frames_dropped);
    gauge!("stream_buffer_utilization").set(stats.buffer_utilization as f64);
    gauge!("stream_buffer_depth").set(stats.buffer_depth as f64);
    if stats.frames_streamed > 0 {
        histogram!("stream_load_time_ms").record(stats.average_load_time_ms as f64);
    }
}

pub fn record_cleanup(outcome: &CleanupOutcome) {
    if outcome.freed_bytes > 0 {
        counter!("vram_cleanup_freed_bytes_total").increment(outcome.freed_bytes as u64);
    }
}
