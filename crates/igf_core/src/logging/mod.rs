//! Logging infrastructure.
//!
//! - Global `tracing` subscriber for library diagnostics, to stderr and
//!   optionally to a daily event log file
//! - Per-session [`SessionLogger`]: one block per stage run, tool command
//!   lines and exit codes, thinned progress and an output tail dumped when
//!   a stage fails
//!
//! # Example
//!
//! ```no_run
//! use igf_core::invalidation::{DirtyReason, Stage};
//! use igf_core::logging::{LogConfig, SessionLogger};
//!
//! let logger = SessionLogger::new("session", ".logs", LogConfig::default(), None).unwrap();
//! logger.begin_stage(Stage::Extracted, &[DirtyReason::NeverRun]);
//! logger.progress("Extract", 50);
//! logger.finish_stage(50);
//! ```

mod session_logger;
mod types;

use std::path::Path;

pub use session_logger::SessionLogger;
pub use types::{LogCallback, LogConfig, LogLevel, StageLog};

pub use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// File name prefix of the daily event log.
pub const EVENT_LOG_NAME: &str = "igf-event.log";

fn env_filter(default_level: LogLevel) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level.as_filter()))
}

/// Install the global subscriber writing to stderr.
///
/// `RUST_LOG` wins over `default_level`. Call once at startup.
pub fn init_tracing(default_level: LogLevel) {
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(false),
        )
        .with(env_filter(default_level))
        .init();
}

/// Like [`init_tracing`], plus a non-blocking daily file in `log_dir`.
///
/// Keep the returned guard alive; dropping it flushes and stops the writer.
pub fn init_file_tracing(log_dir: &Path, default_level: LogLevel) -> std::io::Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)?;
    let appender = tracing_appender::rolling::daily(log_dir, EVENT_LOG_NAME);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(false),
        )
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .with(env_filter(default_level))
        .init();

    Ok(guard)
}

/// Initialize tracing for tests (only logs warnings and above).
#[cfg(test)]
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .with_test_writer()
        .try_init();
}
