//! Telemetry: structured logging, metrics and state snapshots.
//!
//! All output goes to the tracing subscriber or an installed metrics
//! recorder; nothing here opens network connections.

mod logging;
pub mod metrics;
mod snapshot;

pub use logging::{init_logging, LogConfig, LogError, LogFormat};
pub use self::metrics::init_metrics;
pub use snapshot::TelemetrySnapshot;
