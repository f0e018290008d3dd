//! Point-in-time telemetry snapshot.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::cache::MemoryStats;
use crate::compression::CompressionStats;
use crate::monitor::VramStatus;
use crate::pattern::AccessPattern;
use crate::streaming::StreamingStats;

/// Combined view of the optimizer's state.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetrySnapshot {
    pub timestamp: DateTime<Utc>,
    pub memory: MemoryStats,
    pub streaming: StreamingStats,
    pub vram: VramStatus,
    pub access_pattern: AccessPattern,
    pub compression: CompressionStats,
}

impl TelemetrySnapshot {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::PressureLevel;

    #[test]
    fn test_snapshot_json_fields() {
        let snapshot = TelemetrySnapshot {
            timestamp: Utc::now(),
            memory: MemoryStats {
                cache_entries: 3,
                cache_hits: 7,
                ..Default::default()
            },
            streaming: StreamingStats::default(),
            vram: VramStatus {
                total_vram: 1000,
                used_vram: 950,
                level: PressureLevel::Critical,
                ..Default::default()
            },
            access_pattern: AccessPattern::default(),
            compression: CompressionStats::default(),
        };

        let value: serde_json::Value = serde_json::from_str(&snapshot.to_json().unwrap()).unwrap();
        assert_eq!(value["memory"]["cache_entries"], 3);
        assert_eq!(value["memory"]["cache_hits"], 7);
        assert_eq!(value["vram"]["level"], "critical");
        assert_eq!(value["access_pattern"]["pattern_type"], "random");
        assert_eq!(value["streaming"]["quality"], "full");
        assert!(value["timestamp"].is_string());
    }
}
