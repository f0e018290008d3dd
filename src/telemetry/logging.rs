//! Subscriber setup for the optimizer's `tracing` events.
//!
//! The `[logging]` section of the optimizer configuration picks the format,
//! filter and destination. `VRAM_CORE_LOG` overrides the configured filter
//! so a host editor can raise verbosity without editing its config file.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable that replaces `LogConfig::level` when set.
pub const LOG_ENV: &str = "VRAM_CORE_LOG";

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// One JSON object per event, for log collectors.
    #[default]
    Json,
    /// Multi-line human output.
    Pretty,
    /// Single-line human output for an editor's console pane.
    Compact,
}

/// `[logging]` configuration section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub format: LogFormat,
    /// `EnvFilter` directive, e.g. `"warn,vram_core=debug"`.
    pub level: String,
    /// Log file. Stderr when unset.
    pub output_path: Option<PathBuf>,
    /// Keep earlier sessions in `output_path` instead of truncating it.
    pub append: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Json,
            level: "warn,vram_core=info".to_string(),
            output_path: None,
            append: false,
        }
    }
}

impl LogConfig {
    pub fn development() -> Self {
        Self {
            format: LogFormat::Pretty,
            level: "warn,vram_core=debug".to_string(),
            ..Default::default()
        }
    }

    /// Check the configured directive without consulting the environment.
    pub fn validate(&self) -> Result<(), LogError> {
        parse_filter(&self.level).map(drop)
    }

    /// Directive in effect after the `VRAM_CORE_LOG` override.
    pub fn effective_level(&self) -> String {
        resolve_level(&self.level, std::env::var(LOG_ENV).ok())
    }

    fn writer(&self) -> Result<(BoxMakeWriter, bool), LogError> {
        match &self.output_path {
            Some(path) => {
                let file = open_log_file(path, self.append)?;
                Ok((BoxMakeWriter::new(Mutex::new(file)), false))
            }
            None => Ok((BoxMakeWriter::new(std::io::stderr), true)),
        }
    }
}

#[derive(Debug, Error)]
pub enum LogError {
    #[error("Invalid log filter: {0}")]
    InvalidFilter(String),
    #[error("Failed to open log file {}: {source}", path.display())]
    FileOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Subscriber already initialized")]
    AlreadyInitialized,
}

/// Install the global tracing subscriber. Call once at startup.
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    let level = config.effective_level();
    let filter = parse_filter(&level)?;
    let (writer, ansi) = config.writer()?;

    let layer = fmt::layer().with_writer(writer).with_ansi(ansi);
    let registry = tracing_subscriber::registry().with(filter);
    let result = match config.format {
        LogFormat::Json => registry.with(layer.json()).try_init(),
        LogFormat::Pretty => registry.with(layer.pretty()).try_init(),
        LogFormat::Compact => registry.with(layer.compact()).try_init(),
    };
    result.map_err(|_| LogError::AlreadyInitialized)?;

    tracing::debug!(format = ?config.format, level = %level, "Logging initialized");
    Ok(())
}

fn parse_filter(level: &str) -> Result<EnvFilter, LogError> {
    EnvFilter::try_new(level).map_err(|e| LogError::InvalidFilter(e.to_string()))
}

/// A blank override counts as unset.
fn resolve_level(configured: &str, env: Option<String>) -> String {
    match env {
        Some(value) if !value.trim().is_empty() => value,
        _ => configured.to_string(),
    }
}

fn open_log_file(path: &Path, append: bool) -> Result<File, LogError> {
    let mut options = OpenOptions::new();
    options.create(true);
    if append {
        options.append(true);
    } else {
        options.write(true).truncate(true);
    }
    options.open(path).map_err(|source| LogError::FileOpen {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_env_override_wins_unless_blank() {
        assert_eq!(resolve_level("info", None), "info");
        assert_eq!(resolve_level("info", Some("vram_core=trace".into())), "vram_core=trace");
        assert_eq!(resolve_level("info", Some("  ".into())), "info");
    }

    #[test]
    fn test_validate_rejects_bad_directive() {
        assert!(LogConfig::default().validate().is_ok());
        let config = LogConfig {
            level: "vram_core=loud".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(LogError::InvalidFilter(_))));
    }

    #[test]
    fn test_log_file_append_and_truncate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.log");

        open_log_file(&path, false).unwrap().write_all(b"first\n").unwrap();
        open_log_file(&path, true).unwrap().write_all(b"second\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first\nsecond\n");

        open_log_file(&path, false).unwrap().write_all(b"third\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "third\n");
    }

    #[test]
    fn test_missing_directory_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent").join("vram.log");
        let err = open_log_file(&path, true).unwrap_err();
        assert!(matches!(&err, LogError::FileOpen { path: p, .. } if p == &path));
        assert!(err.to_string().contains("vram.log"));
    }

    #[test]
    fn test_section_parses_from_toml() {
        let config: LogConfig = toml::from_str(
            r#"
            format = "compact"
            level = "vram_core=debug"
            output_path = "/tmp/vram.log"
            append = true
            "#,
        )
        .unwrap();
        assert_eq!(config.format, LogFormat::Compact);
        assert_eq!(config.output_path.as_deref(), Some(Path::new("/tmp/vram.log")));
        assert!(config.append);
    }
}
