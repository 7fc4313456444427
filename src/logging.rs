//! Logging configuration using tracing

use std::path::Path;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const LOG_FILE_PREFIX: &str = "updater.log";

/// Initialize the logging system
///
/// Console output goes to stderr. When `log_dir` is given, a daily rotated
/// file is written there as well; keep the returned guard alive until exit
/// so buffered lines are flushed. An unusable log directory only costs the
/// file output.
pub fn init(verbose: bool, json: bool, log_dir: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let (writer, guard, file_error) = match log_dir.map(file_writer) {
        Some(Ok((writer, guard))) => (Some(writer), Some(guard), None),
        Some(Err(e)) => (None, None, Some(e)),
        None => (None, None, None),
    };
    let file_layer = writer.map(|w| fmt::layer().with_ansi(false).with_writer(w));

    let registry = tracing_subscriber::registry().with(filter).with(file_layer);

    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()?;
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()?;
    }

    if let Some(e) = file_error {
        tracing::warn!("file logging disabled: {}", e);
    }

    Ok(guard)
}

/// Non-blocking writer for a daily rotated file in `dir`
fn file_writer(dir: &Path) -> anyhow::Result<(NonBlocking, WorkerGuard)> {
    std::fs::create_dir_all(dir)
        .map_err(|e| anyhow::anyhow!("cannot create log directory {}: {}", dir.display(), e))?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .build(dir)
        .map_err(|e| anyhow::anyhow!("cannot open log file in {}: {}", dir.display(), e))?;

    Ok(tracing_appender::non_blocking(appender))
}
