//! Structured logging setup
//!
//! Records always go to the configured log file through a non-blocking
//! appender; `log.include_stdout` adds a second console layer. The
//! returned guard must be held for the life of the process so buffered
//! records are flushed on exit.

use crate::config::LogConfig;
use crate::error::{Error, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Initialize the global tracing subscriber from configuration
pub fn init(config: &LogConfig) -> Result<WorkerGuard> {
    let filter = EnvFilter::try_new(&config.level)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let dir = log_dir(config);
    let file_name = config
        .path
        .file_name()
        .ok_or_else(|| Error::config(format!("invalid log path: {}", config.path.display())))?;

    std::fs::create_dir_all(&dir).map_err(|e| {
        Error::config(format!(
            "failed to create log directory {}: {e}",
            dir.display()
        ))
    })?;

    let appender = tracing_appender::rolling::never(&dir, file_name);
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    let stdout_layer = config.include_stdout.then(fmt::layer);

    // try_init so embedding (and tests) tolerate an existing subscriber
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(file_writer).with_ansi(false))
        .with(stdout_layer)
        .try_init();

    Ok(guard)
}

fn log_dir(config: &LogConfig) -> std::path::PathBuf {
    match config.path.parent() {
        Some(parent) if parent != Path::new("") => parent.to_path_buf(),
        _ => std::path::PathBuf::from("."),
    }
}
