use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{
    non_blocking,
    rolling::{self, RollingFileAppender},
};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Keeps the background log writers alive; logs are flushed when dropped.
pub struct LogGuards {
    _file: WorkerGuard,
    _console: WorkerGuard,
}

/// Console plus per-run file logging, filtered by `RUST_LOG` (default
/// `info`). The previous run's file is moved aside first.
pub fn init_logging(log_dir: &Path, service_name: &str) -> anyhow::Result<LogGuards> {
    if let Err(e) = rotate_logs_on_startup(log_dir, service_name) {
        eprintln!("Could not rotate previous log file: {e:#}");
    }
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log dir {}", log_dir.display()))?;

    let (file_writer, file_guard) = non_blocking(file_appender(log_dir, service_name));
    let (console_writer, console_guard) = non_blocking(std::io::stderr());

    let file_layer = fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_target(true)
        .with_line_number(true);

    let console_layer = fmt::layer()
        .with_writer(console_writer)
        .with_ansi(true)
        .with_target(false);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    info!(
        "Logging initialized - logs will be written to {}",
        log_path(log_dir, service_name).display()
    );

    Ok(LogGuards {
        _file: file_guard,
        _console: console_guard,
    })
}

fn log_path(log_dir: &Path, service_name: &str) -> PathBuf {
    log_dir.join(format!("{service_name}.log"))
}

/// Writes to a fixed `<service>.log`; rotation happens once per run.
fn file_appender(log_dir: &Path, service_name: &str) -> RollingFileAppender {
    rolling::never(log_dir, format!("{service_name}.log"))
}

/// Moves a log left by a previous run aside, returning the backup path.
pub fn rotate_logs_on_startup(log_dir: &Path, service_name: &str) -> anyhow::Result<Option<PathBuf>> {
    let log_path = log_path(log_dir, service_name);
    if !log_path.exists() {
        return Ok(None);
    }

    let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    let backup = log_dir.join(format!("{service_name}.{timestamp}.log"));
    std::fs::rename(&log_path, &backup)
        .with_context(|| format!("Failed to back up {}", log_path.display()))?;
    Ok(Some(backup))
}
