//! File logging for parley
//!
//! Everything goes to `$XDG_STATE_HOME/parley/parley.log.<date>`; stdout is
//! left to the CLI. `RUST_LOG` overrides the configured level.

use crate::config::{Config, LoggingConfig};
use crate::error::{Error, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FILE_PREFIX: &str = "parley.log";

/// Keeps the background writer alive; pending lines are flushed on drop.
pub struct LoggingGuard {
    _worker: WorkerGuard,
}

/// Start logging into the XDG state directory.
pub fn init(config: &LoggingConfig) -> Result<LoggingGuard> {
    init_in(&Config::state_dir(), config)
}

/// Start logging into `log_dir`, rotating daily and keeping at most
/// `config.max_files` files.
///
/// Only the first call in a process installs a subscriber. Later calls still
/// create the directory and return a guard, but their output goes nowhere.
pub fn init_in(log_dir: &Path, config: &LoggingConfig) -> Result<LoggingGuard> {
    std::fs::create_dir_all(log_dir)?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .max_log_files(config.max_files.max(1))
        .build(log_dir)
        .map_err(|e| Error::Config(format!("failed to create log appender: {}", e)))?;
    let (writer, worker) = tracing_appender::non_blocking(appender);

    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_line_number(true);

    if let Err(e) = tracing_subscriber::registry()
        .with(level_filter(&config.level))
        .with(layer)
        .try_init()
    {
        tracing::debug!(error = %e, "Global subscriber already set, keeping it");
    }

    tracing::info!(
        log_dir = %log_dir.display(),
        level = %config.level,
        max_files = config.max_files,
        "Logging initialized"
    );

    Ok(LoggingGuard { _worker: worker })
}

/// `RUST_LOG` if set, else the configured level, else `info`.
fn level_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_init_creates_log_dir() {
        let dir = TempDir::new().unwrap();
        let log_dir = dir.path().join("state").join("parley");

        let guard = init_in(&log_dir, &LoggingConfig::default()).unwrap();
        assert!(log_dir.is_dir());
        drop(guard);
    }

    #[test]
    fn test_second_init_still_returns_guard() {
        let dir = TempDir::new().unwrap();
        let config = LoggingConfig {
            level: "debug".to_string(),
            max_files: 0,
        };

        let first = init_in(&dir.path().join("a"), &config).unwrap();
        let second = init_in(&dir.path().join("b"), &config).unwrap();
        assert!(dir.path().join("b").is_dir());
        drop(second);
        drop(first);
    }
}
