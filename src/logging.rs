//! Log setup for the binary.
//!
//! Logs go to a daily-rolling file under the data directory so the terminal
//! only shows command output.

use std::path::Path;

use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

/// Environment variable holding the log filter (e.g. `vaultcache=debug`).
pub const LOG_ENV: &str = "VAULTCACHE_LOG";

fn filter(verbose: bool) -> EnvFilter {
  if verbose {
    return EnvFilter::new("debug");
  }
  EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber writing to `<dir>/vaultcache.log.<date>`.
///
/// Keep the returned guard alive until exit or buffered lines are lost.
pub fn init(dir: &Path, verbose: bool) -> Result<WorkerGuard> {
  std::fs::create_dir_all(dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(dir, "vaultcache.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::registry()
    .with(filter(verbose))
    .with(fmt::layer().with_writer(writer).with_ansi(false))
    .try_init()
    .map_err(|e| eyre!("Failed to install log subscriber: {}", e))?;

  Ok(guard)
}
