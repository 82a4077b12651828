//! Tracing subscriber setup.

use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the filter directives (e.g., `paysync=debug`)
pub const LOG_ENV: &str = "PAYSYNC_LOG";

const LOG_FILE_PREFIX: &str = "paysync.log";

/// Platform data directory for log files.
pub fn default_log_dir() -> Option<PathBuf> {
  dirs::data_dir().map(|d| d.join("paysync").join("logs"))
}

/// Install a global subscriber writing to a daily rolling file in `log_dir`.
///
/// The returned guard flushes buffered lines on drop and must outlive the program's work.
pub fn init(log_dir: &Path) -> Result<WorkerGuard> {
  std::fs::create_dir_all(log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_ansi(false)
    .with_target(false)
    .with_writer(writer)
    .try_init()
    .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;

  Ok(guard)
}
