//! VRAM-CORE GPU Memory Optimizer
//!
//! Keeps the textures a video editor needs resident in a bounded VRAM
//! budget while the timeline plays, scrubs or renders.
//!
//! # Components
//!
//! - **Cache**: priority-scored texture cache with leases, critical pinning
//!   and background compression of idle entries
//! - **Pattern**: classifies frame access and predicts upcoming frames
//! - **Compression**: lossless and lossy texture codecs behind one manager
//! - **Streaming**: read-ahead loader pool with adaptive quality
//! - **Monitor**: VRAM pressure levels driving cleanup
//! - **Optimizer**: owns the above and runs the monitoring loop
//!
//! # Threads
//!
//! OS threads only: one cache optimization thread, the streaming loaders and
//! one monitoring thread. All of them stop when the optimizer is dropped.

pub mod cache;
pub mod compression;
pub mod config;
pub mod device;
pub mod monitor;
pub mod optimizer;
pub mod pattern;
pub mod streaming;
pub mod telemetry;
mod worker;

pub use cache::{
    frame_texture_hash, generate_texture_hash, CacheConfig, CacheEntryInfo, CacheError, IntelligentCache,
    MemoryStats, OptimizationReport, TextureLease,
};
pub use compression::{
    CompressionError, CompressionInfo, CompressionLevel, CompressionPolicy, TextureCompression,
};
pub use config::{ConfigError, OptimizerConfig};
pub use device::{
    DeviceError, DeviceMemoryInfo, GraphicsDevice, MockDevice, TextureDesc, TextureFormat, TextureHandle,
};
pub use monitor::{CleanupOutcome, PressureLevel, Thresholds, VramMonitor, VramStatus};
pub use optimizer::{GpuMemoryOptimizer, OptimizerError, Workflow};
pub use pattern::{AccessPattern, AccessPatternAnalyzer, PatternConfig, PatternType};
pub use streaming::{
    FrameLoader, LoadedFrame, StreamQuality, StreamingConfig, StreamingOptimizer, StreamingStats,
    StreamingTuning, SyntheticFrameLoader,
};
pub use telemetry::{init_logging, LogConfig, LogError, LogFormat, TelemetrySnapshot};
