use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use clausebook::config::LoggingConfig;

/// Log to a daily file so stdout stays clean for command output.
///
/// The filter comes from CLAUSEBOOK_LOG, then the config file, then "info".
/// Keep the returned guard alive until exit or buffered lines are lost.
pub fn init(config: &LoggingConfig) -> Result<WorkerGuard> {
  let dir = match &config.dir {
    Some(dir) => dir.clone(),
    None => default_dir()?,
  };
  std::fs::create_dir_all(&dir)?;

  let appender = tracing_appender::rolling::daily(&dir, "clausebook.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let default_filter = config.filter.as_deref().unwrap_or("info");
  let filter =
    EnvFilter::try_from_env("CLAUSEBOOK_LOG").unwrap_or_else(|_| EnvFilter::new(default_filter));

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(writer).with_ansi(false))
    .try_init()?;

  Ok(guard)
}

/// Like [`init`], but a log file that cannot be set up only costs the log.
/// The reason goes to stderr and the command runs without file logging.
pub fn init_or_warn(config: &LoggingConfig) -> Option<WorkerGuard> {
  match init(config) {
    Ok(guard) => Some(guard),
    Err(e) => {
      eprintln!("warning: file logging disabled: {}", e);
      None
    }
  }
}

fn default_dir() -> Result<PathBuf> {
  dirs::data_dir()
    .map(|dir| dir.join("clausebook").join("logs"))
    .ok_or_else(|| eyre!("Could not determine data directory"))
}
