use color_eyre::{eyre::eyre, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

const LOG_ENV: &str = "FLOORSYNC_LOG";
const LOG_FILE: &str = "floorsync.log";

/// Log to a daily file under `log_dir`, and to stderr for warnings and above.
///
/// The returned guard flushes the file writer on drop; keep it alive for the
/// whole run.
pub fn init(log_dir: &Path) -> Result<WorkerGuard> {
  std::fs::create_dir_all(log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

  let appender = tracing_appender::rolling::daily(log_dir, LOG_FILE);
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let file_layer = fmt::layer()
    .with_writer(writer)
    .with_ansi(false)
    .with_target(true);

  let stderr_layer = fmt::layer()
    .with_writer(std::io::stderr)
    .with_target(false)
    .with_filter(LevelFilter::WARN);

  tracing_subscriber::registry()
    .with(filter)
    .with(file_layer)
    .with(stderr_layer)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  tracing::debug!(dir = %log_dir.display(), "Logging initialized");
  Ok(guard)
}
