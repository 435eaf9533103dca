//! Levels, session log configuration and per-stage summaries.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::LoggingSettings;
use crate::invalidation::Stage;

/// Severity of a session log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// `EnvFilter` directive for this level.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    /// Column tag written in the session log.
    pub(crate) fn tag(&self) -> &'static str {
        match self {
            LogLevel::Trace | LogLevel::Debug => "dbg",
            LogLevel::Info => "   ",
            LogLevel::Warn => "WRN",
            LogLevel::Error => "ERR",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let level = match s.trim().to_ascii_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "info" => LogLevel::Info,
            "warn" | "warning" => LogLevel::Warn,
            "error" => LogLevel::Error,
            other => return Err(format!("Unknown log level '{}'", other)),
        };
        Ok(level)
    }
}

/// How a [`SessionLogger`](super::SessionLogger) writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Lines below this level are dropped.
    pub level: LogLevel,
    /// Tool output goes to the failure tail only, and progress is thinned
    /// to `progress_step` crossings per tool.
    pub compact: bool,
    /// Percent step between progress lines in compact mode.
    pub progress_step: u32,
    /// Tool output lines dumped when a stage fails.
    pub error_tail: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::from_settings(&LoggingSettings::default())
    }
}

impl LogConfig {
    /// Config from the `[logging]` section. Unknown levels read as info.
    pub fn from_settings(settings: &LoggingSettings) -> Self {
        Self {
            level: settings.level.parse().unwrap_or_default(),
            compact: settings.compact,
            progress_step: settings.progress_step.max(1),
            error_tail: settings.error_tail as usize,
        }
    }
}

/// Receives every line written to the session log.
pub type LogCallback = Box<dyn Fn(&str) + Send + Sync>;

/// What one stage did, as seen by the session log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageLog {
    /// Stage the block belonged to.
    pub stage: Stage,
    /// Tool invocations started during the stage.
    pub tools_run: usize,
    /// Invocations that exited unsuccessfully, lenient runs included.
    pub tools_failed: usize,
    /// Time from `begin_stage` to the close of the block.
    pub elapsed: Duration,
}
