//! Tracing setup.
//!
//! On Linux the journal is preferred. Everywhere else, or when journald is not
//! reachable, events go to a daily rolling file, mirrored to stderr when it is
//! attached to a terminal.

use anyhow::{Context, Result};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding the filter directive, e.g. `YEARBOOK_LOG=debug`
/// or `YEARBOOK_LOG=yearbook::jobs=trace,info`.
pub const LOG_ENV: &str = "YEARBOOK_LOG";

static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

fn filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Must be called at most once per process.
pub fn init(log_dir: Option<PathBuf>) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        if let Ok(journald_layer) = tracing_journald::layer() {
            tracing_subscriber::registry()
                .with(filter())
                .with(journald_layer)
                .try_init()
                .context("Failed to install journald subscriber")?;

            tracing::info!("Logging to journald");
            return Ok(());
        }
    }

    let log_dir = log_dir.unwrap_or_else(default_log_dir);
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, "yearbook.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    // The guard flushes on drop, so it has to live for the rest of the process.
    let _ = FILE_GUARD.set(guard);

    let stderr_layer = std::io::stderr()
        .is_terminal()
        .then(|| fmt::layer().with_writer(std::io::stderr).with_target(false));

    tracing_subscriber::registry()
        .with(filter())
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .with(stderr_layer)
        .try_init()
        .context("Failed to install file subscriber")?;

    tracing::info!(log_dir = %log_dir.display(), "Logging to file");
    Ok(())
}

pub fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("yearbook")
        .join("logs")
}
