//! Tracing subscriber setup for the binary.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::config::LogConfig;

/// Parse log level from config string
fn parse_log_level(level: &str) -> tracing::Level {
  match level.to_lowercase().as_str() {
    "off" | "error" => tracing::Level::ERROR,
    "warn" => tracing::Level::WARN,
    "info" => tracing::Level::INFO,
    "debug" => tracing::Level::DEBUG,
    "trace" => tracing::Level::TRACE,
    _ => tracing::Level::INFO,
  }
}

fn env_filter(config: &LogConfig) -> EnvFilter {
  // RUST_LOG overrides the configured level
  EnvFilter::builder()
    .with_default_directive(parse_log_level(&config.level).into())
    .from_env_lossy()
}

/// Initialize logging: stderr always, plus a daily-rotated file when a log
/// directory is configured.
///
/// Returns the guard that must be kept alive for the duration of the program
pub fn init(config: &LogConfig) -> Option<WorkerGuard> {
  let console = fmt::layer()
    .with_writer(std::io::stderr)
    .with_target(false)
    .with_filter(env_filter(config));

  let Some(dir) = &config.directory else {
    tracing_subscriber::registry().with(console).init();
    return None;
  };

  if std::fs::create_dir_all(dir).is_err() {
    // Fall back to console-only logging
    tracing_subscriber::registry().with(console).init();
    tracing::warn!(dir = %dir.display(), "Could not create log directory");
    return None;
  }

  let (file_writer, guard) =
    tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "vaultcache.log"));
  let file = fmt::layer()
    .with_writer(file_writer)
    .with_ansi(false)
    .with_filter(env_filter(config));

  tracing_subscriber::registry().with(console).with(file).init();
  Some(guard)
}
