//! Tracing subscriber setup for binaries.
//!
//! The library only emits `tracing` events; it never installs a subscriber.
//! Binaries call [`init_logging`] once at startup and keep the returned
//! [`LoggingGuard`] alive until exit so buffered file output is flushed.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{fmt, EnvFilter};

/// Errors raised while installing the subscriber.
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Invalid log level {level:?}: {source}")]
    InvalidLevel {
        level: String,
        #[source]
        source: ParseError,
    },

    #[error("Invalid log file path: {0}")]
    InvalidPath(PathBuf),

    #[error("Failed to create log directory: {0}")]
    Io(#[from] io::Error),

    #[error("A global subscriber is already installed: {0}")]
    AlreadyInstalled(#[from] TryInitError),
}

/// Keeps the non-blocking file writer running. Drop it last.
#[must_use = "dropping the guard stops file logging"]
#[derive(Debug)]
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

/// Build the filter: `RUST_LOG` if set, otherwise `level`.
pub fn env_filter(level: &str) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    parse_level(level)
}

fn parse_level(level: &str) -> Result<EnvFilter, LoggingError> {
    EnvFilter::try_new(level).map_err(|source| LoggingError::InvalidLevel {
        level: level.to_string(),
        source,
    })
}

/// Install the global subscriber.
///
/// Logs go to stderr, and additionally to `log_file` (without ANSI colours)
/// when one is given.
pub fn init_logging(level: &str, log_file: Option<&Path>) -> Result<LoggingGuard, LoggingError> {
    let filter = env_filter(level)?;
    let stderr_layer = fmt::layer().with_writer(io::stderr).with_target(false);

    let (file_layer, file_guard) = match log_file {
        Some(path) => {
            let name = path
                .file_name()
                .ok_or_else(|| LoggingError::InvalidPath(path.to_path_buf()))?;
            let dir = path
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            std::fs::create_dir_all(dir)?;

            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()?;

    Ok(LoggingGuard { _file: file_guard })
}
