//! Composed optimizer configuration.
//!
//! One immutable snapshot covering the cache, streaming, pressure
//! thresholds, pattern analysis and compression policy. It can be built in
//! code or parsed from TOML; fields missing from the document keep their
//! defaults.
//!
//! ```toml
//! enable_background_optimization = true
//! optimization_interval_ms = 1000
//!
//! [cache]
//! max_cache_size = 2147483648
//! eviction_threshold = 0.85
//!
//! [streaming]
//! read_ahead_frames = 30
//!
//! [thresholds]
//! warning_threshold = 0.75
//! cleanup_threshold = 0.85
//! critical_threshold = 0.90
//!
//! [logging]
//! format = "compact"
//! level = "warn,vram_core=debug"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::CacheConfig;
use crate::compression::CompressionPolicy;
use crate::monitor::Thresholds;
use crate::pattern::PatternConfig;
use crate::streaming::StreamingConfig;
use crate::telemetry::LogConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
}

/// Complete optimizer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub cache: CacheConfig,
    pub streaming: StreamingConfig,
    pub thresholds: Thresholds,
    pub pattern: PatternConfig,
    pub compression: CompressionPolicy,
    /// Read by the host when it calls `init_logging`.
    pub logging: LogConfig,
    /// Run the cache optimization thread.
    pub enable_background_optimization: bool,
    /// Monitoring tick period.
    pub optimization_interval_ms: u64,
    /// Record metrics and log telemetry snapshots on each tick.
    pub enable_telemetry: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            streaming: StreamingConfig::default(),
            thresholds: Thresholds::default(),
            pattern: PatternConfig::default(),
            compression: CompressionPolicy::default(),
            logging: LogConfig::default(),
            enable_background_optimization: true,
            optimization_interval_ms: 1000,
            enable_telemetry: true,
        }
    }
}

impl OptimizerConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn optimization_interval(&self) -> Duration {
        Duration::from_millis(self.optimization_interval_ms)
    }

    /// Reject zero sizes, out-of-range ratios and inverted thresholds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.cache;
        if c.max_cache_size == 0 {
            return invalid("cache.max_cache_size must be positive");
        }
        if c.max_entries == 0 {
            return invalid("cache.max_entries must be positive");
        }
        if !in_unit(c.eviction_threshold) || c.eviction_threshold == 0.0 {
            return invalid("cache.eviction_threshold must be in (0, 1]");
        }
        if !in_unit(c.quality_threshold) {
            return invalid("cache.quality_threshold must be in [0, 1]");
        }
        if !in_unit(c.cleanup_target_ratio) || c.cleanup_target_ratio == 0.0 {
            return invalid("cache.cleanup_target_ratio must be in (0, 1]");
        }
        if c.background_interval_ms == 0 {
            return invalid("cache.background_interval_ms must be positive");
        }

        let t = &self.thresholds;
        if !(t.warning_threshold > 0.0
            && t.warning_threshold <= t.cleanup_threshold
            && t.cleanup_threshold <= t.critical_threshold
            && t.critical_threshold <= 1.0)
        {
            return invalid("thresholds must satisfy 0 < warning <= cleanup <= critical <= 1");
        }
        if !(0.0..0.5).contains(&t.hysteresis) {
            return invalid("thresholds.hysteresis must be in [0, 0.5)");
        }

        let s = &self.streaming;
        if s.streaming_buffer_size == 0 {
            return invalid("streaming.streaming_buffer_size must be positive");
        }
        if s.read_ahead_frames == 0 {
            return invalid("streaming.read_ahead_frames must be positive");
        }
        if s.min_read_ahead_frames > s.max_read_ahead_frames {
            return invalid("streaming.min_read_ahead_frames exceeds max_read_ahead_frames");
        }
        if !in_unit(s.load_threshold) {
            return invalid("streaming.load_threshold must be in [0, 1]");
        }
        if !(s.target_frame_time_ms > 0.0) {
            return invalid("streaming.target_frame_time_ms must be positive");
        }

        let p = &self.pattern;
        if p.window < 2 {
            return invalid("pattern.window must be at least 2");
        }
        if !in_unit(p.confidence_threshold) || !in_unit(p.sequential_ratio) {
            return invalid("pattern ratios must be in [0, 1]");
        }

        if !(self.compression.mib_value_ms >= 0.0) {
            return invalid("compression.mib_value_ms must be non-negative");
        }
        if self.optimization_interval_ms == 0 {
            return invalid("optimization_interval_ms must be positive");
        }
        if let Err(e) = self.logging.validate() {
            return invalid(&format!("logging.level: {e}"));
        }
        Ok(())
    }
}

fn in_unit(v: f32) -> bool {
    (0.0..=1.0).contains(&v)
}

fn invalid(msg: &str) -> Result<(), ConfigError> {
    Err(ConfigError::Invalid(msg.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::CompressionLevel;

    #[test]
    fn test_defaults_are_valid() {
        let config = OptimizerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cache.max_cache_size, 2 * 1024 * 1024 * 1024);
        assert_eq!(config.streaming.read_ahead_frames, 30);
        assert_eq!(config.thresholds.critical_threshold, 0.90);
        assert_eq!(config.optimization_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = OptimizerConfig::from_toml_str(
            r#"
            enable_telemetry = false

            [cache]
            max_cache_size = 1048576

            [streaming]
            read_ahead_frames = 12

            [compression]
            background_level = "maximum"
            "#,
        )
        .unwrap();

        assert!(!config.enable_telemetry);
        assert_eq!(config.cache.max_cache_size, 1024 * 1024);
        assert_eq!(config.cache.max_entries, CacheConfig::default().max_entries);
        assert_eq!(config.streaming.read_ahead_frames, 12);
        assert_eq!(config.streaming.max_concurrent_loads, 4);
        assert_eq!(config.compression.background_level, CompressionLevel::Maximum);
        assert_eq!(config.thresholds.warning_threshold, 0.75);
    }

    #[test]
    fn test_empty_document_is_default() {
        let config = OptimizerConfig::from_toml_str("").unwrap();
        assert_eq!(config.optimization_interval_ms, 1000);
        assert!(config.enable_background_optimization);
    }

    #[test]
    fn test_inverted_thresholds_rejected() {
        let result = OptimizerConfig::from_toml_str(
            r#"
            [thresholds]
            warning_threshold = 0.95
            critical_threshold = 0.80
            "#,
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_zero_sizes_rejected() {
        let mut config = OptimizerConfig::default();
        config.cache.max_cache_size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = OptimizerConfig::default();
        config.streaming.read_ahead_frames = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = OptimizerConfig::default();
        config.optimization_interval_ms = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_logging_section() {
        let config = OptimizerConfig::from_toml_str(
            r#"
            [logging]
            format = "compact"
            level = "warn,vram_core=debug"
            "#,
        )
        .unwrap();
        assert_eq!(config.logging.format, crate::telemetry::LogFormat::Compact);
        assert_eq!(config.logging.level, "warn,vram_core=debug");
        assert!(config.logging.output_path.is_none());

        let result = OptimizerConfig::from_toml_str("[logging]\nlevel = \"vram_core=loud\"");
        assert!(matches!(result, Err(ConfigError::Invalid(msg)) if msg.starts_with("logging.level")));
    }

    #[test]
    fn test_malformed_toml_is_parse_error() {
        let result = OptimizerConfig::from_toml_str("[cache\nmax_cache_size = ");
        assert!(matches!(result, Err(ConfigError::Parse(_))));

        let result = OptimizerConfig::from_toml_str("[cache]\nmax_cache_size = \"big\"");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_toml_output_parses_back() {
        let mut config = OptimizerConfig::default();
        config.streaming.read_ahead_frames = 45;
        let text = config.to_toml_string().unwrap();
        let parsed = OptimizerConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed.streaming.read_ahead_frames, 45);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vram.toml");
        std::fs::write(&path, "optimization_interval_ms = 250\n").unwrap();

        let config = OptimizerConfig::from_file(&path).unwrap();
        assert_eq!(config.optimization_interval_ms, 250);

        let missing = OptimizerConfig::from_file(dir.path().join("absent.toml"));
        assert!(matches!(missing, Err(ConfigError::Io(_))));
    }
}
