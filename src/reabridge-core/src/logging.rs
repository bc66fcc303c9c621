//! Process-wide `tracing` setup.
//!
//! Clients log to stderr so stdout stays usable for results. An agent runs
//! inside the host, where nobody reads stderr, so the rolling file under
//! the log directory is what matters there.

use crate::{config::LoggingConfig, paths::AppDirs};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_LOG_FILE: &str = "reabridge.log";
/// Checked before `RUST_LOG` so the bridge can be tuned without touching the host's own filter.
const FILTER_ENV: &str = "REABRIDGE_LOG";

/// Flushes the background file writer when dropped.
#[must_use = "dropping the guard stops file logging"]
pub struct LoggingGuard {
    _writer: WorkerGuard,
    log_file: PathBuf,
}

impl LoggingGuard {
    /// Path stem of the rolling log file; each day gets a date suffix.
    pub fn log_file(&self) -> &Path {
        &self.log_file
    }
}

pub fn init_logging(config: &LoggingConfig, dirs: &AppDirs) -> Result<LoggingGuard, LoggingError> {
    let filter = filter(config)?;
    let log_dir = dirs.log_dir();
    fs::create_dir_all(log_dir).map_err(|source| LoggingError::CreateDirectory {
        path: log_dir.to_path_buf(),
        source,
    })?;

    let stem = config.file_name.as_deref().unwrap_or(DEFAULT_LOG_FILE);
    let removed = prune_logs(log_dir, stem, config.max_log_files.max(1))?;
    let (file, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, stem));

    let writer = if config.stdout {
        BoxMakeWriter::new(std::io::stderr.and(file))
    } else {
        BoxMakeWriter::new(file)
    };

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .with_ansi(config.stdout)
        .with_writer(writer)
        .try_init()
        .map_err(LoggingError::SubscriberInstall)?;

    if !removed.is_empty() {
        tracing::debug!(count = removed.len(), "pruned old log files");
    }
    Ok(LoggingGuard {
        _writer: guard,
        log_file: log_dir.join(stem),
    })
}

fn filter(config: &LoggingConfig) -> Result<EnvFilter, LoggingError> {
    let directive = directive(config, |name| std::env::var(name).ok());
    EnvFilter::try_new(&directive).map_err(|source| LoggingError::ParseLevel {
        level: directive,
        source,
    })
}

fn directive(config: &LoggingConfig, env: impl Fn(&str) -> Option<String>) -> String {
    [FILTER_ENV, "RUST_LOG"]
        .into_iter()
        .filter_map(env)
        .find(|value| !value.trim().is_empty())
        .unwrap_or_else(|| config.level.directive().to_string())
}

/// Deletes all but the `keep` most recently modified files named `stem*`.
fn prune_logs(dir: &Path, stem: &str, keep: usize) -> Result<Vec<PathBuf>, LoggingError> {
    let listing = fs::read_dir(dir).map_err(|source| LoggingError::ReadDir {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut logs: Vec<(SystemTime, PathBuf)> = listing
        .flatten()
        .filter(|entry| entry.file_name().to_string_lossy().starts_with(stem))
        .filter_map(|entry| {
            let modified = entry.metadata().and_then(|meta| meta.modified()).ok()?;
            Some((modified, entry.path()))
        })
        .collect();

    // Newest first; everything past `keep` goes.
    logs.sort_by(|a, b| b.0.cmp(&a.0));
    let mut removed = Vec::new();
    for (_, path) in logs.into_iter().skip(keep) {
        fs::remove_file(&path).map_err(|source| LoggingError::Cleanup {
            path: path.clone(),
            source,
        })?;
        removed.push(path);
    }
    Ok(removed)
}

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("cannot create log directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid log filter {level:?}: {source}")]
    ParseLevel {
        level: String,
        source: tracing_subscriber::filter::ParseError,
    },
    #[error("a global tracing subscriber is already installed: {0}")]
    SubscriberInstall(Box<dyn std::error::Error + Send + Sync>),
    #[error("cannot list log directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot remove old log file {path}: {source}")]
    Cleanup {
        path: PathBuf,
        source: std::io::Error,
    },
}
