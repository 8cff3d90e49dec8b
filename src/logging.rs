use color_eyre::{eyre::eyre, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_FILTER: &str = "catalog_proxy=info";
const LOG_FILE_PREFIX: &str = "catalog-proxy.log";

/// Install the global subscriber: human output on stderr plus a daily log
/// file under `log_dir`. `RUST_LOG` overrides the default filter.
///
/// Keep the returned guard alive for the life of the process or buffered
/// file output is lost.
pub fn init(log_dir: &Path) -> Result<WorkerGuard> {
  std::fs::create_dir_all(log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
  let (file_writer, guard) = tracing_appender::non_blocking(appender);

  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(std::io::stderr))
    .with(fmt::layer().with_ansi(false).with_writer(file_writer))
    .try_init()
    .map_err(|e| eyre!("Failed to install log subscriber: {}", e))?;

  Ok(guard)
}
