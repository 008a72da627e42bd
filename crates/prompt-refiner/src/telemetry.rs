//! Process-wide logging setup.
//!
//! Two sinks: human-readable stdout and a daily-rotated plain-text file under
//! the configured log directory, written through a non-blocking worker. The
//! returned guard flushes the file writer on drop, so `main` keeps it alive.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const LOG_FILE_PREFIX: &str = "refiner";
const LOG_FILE_SUFFIX: &str = "log";
const KEEP_LOG_FILES: usize = 7;

pub struct TelemetryGuard {
    _file: Option<WorkerGuard>,
}

fn file_appender(dir: &Path) -> Result<RollingFileAppender, String> {
    std::fs::create_dir_all(dir)
        .map_err(|e| format!("log dir init failed for {}: {e}", dir.display()))?;
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix(LOG_FILE_SUFFIX)
        .max_log_files(KEEP_LOG_FILES)
        .build(dir)
        .map_err(|e| format!("log file init failed: {e}"))
}

/// Install the global subscriber. `RUST_LOG` overrides the `info` default.
pub fn init(log_dir: &Path) -> TelemetryGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    let (file_layer, guard, setup_error) = match file_appender(log_dir) {
        Ok(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_writer(writer);
            (Some(layer), Some(guard), None)
        }
        Err(e) => (None, None, Some(e)),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .with(file_layer)
        .init();

    if let Some(error) = setup_error {
        tracing::warn!("{error}; logging to stdout only");
    }

    TelemetryGuard { _file: guard }
}
