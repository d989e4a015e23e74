//! Structured logging: human-readable stderr plus an NDJSON file with
//! date-based rotation and bounded retention.

use std::fs;
use std::io;
use std::path::Path;
use std::time::SystemTime;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ServerConfig;

/// Rotated files kept on disk.
const LOG_RETENTION_FILES: usize = 14;

/// Initialize the global subscriber. The returned guard must be held for the
/// process lifetime so the non-blocking file writer flushes on exit.
pub fn init(config: &ServerConfig) -> io::Result<WorkerGuard> {
    let logs_dir = config.logs_dir();
    fs::create_dir_all(&logs_dir)?;

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("dorkos")
        .filename_suffix("log")
        .build(&logs_dir)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_filter.clone()));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false)
                .with_writer(file_writer),
        )
        .init();

    Ok(guard)
}

/// Delete rotated log files beyond the retention count, oldest first.
/// Rotation errors are non-fatal; callers log and move on.
pub fn prune_rotated_logs(logs_dir: &Path) -> io::Result<usize> {
    let mut files: Vec<(SystemTime, std::path::PathBuf)> = fs::read_dir(logs_dir)?
        .filter_map(Result::ok)
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with("dorkos") && name.contains("log"))
        })
        .filter_map(|entry| {
            let modified = entry.metadata().ok()?.modified().ok()?;
            Some((modified, entry.path()))
        })
        .collect();

    if files.len() <= LOG_RETENTION_FILES {
        return Ok(0);
    }

    // Path is the tiebreak: dated filenames sort oldest-first.
    files.sort();
    let excess = files.len() - LOG_RETENTION_FILES;
    let mut removed = 0;
    for (_, path) in files.into_iter().take(excess) {
        if fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}

/// Background retention sweep, run daily. Errors are logged at warn.
pub fn spawn_retention_sweep(config: &ServerConfig) -> tokio::task::JoinHandle<()> {
    let logs_dir = config.logs_dir();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(24 * 60 * 60));
        loop {
            interval.tick().await;
            match prune_rotated_logs(&logs_dir) {
                Ok(0) => {}
                Ok(n) => tracing::debug!(removed = n, "Pruned rotated log files"),
                Err(e) => tracing::warn!(error = %e, "Log retention sweep failed"),
            }
        }
    })
}
