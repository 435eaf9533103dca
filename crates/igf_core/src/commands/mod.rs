//! Typed builders for every external tool call.
//!
//! Builders only assemble a [`ProcessInvocation`]; running it is up to the
//! caller through an [`ExecContext`]. Arguments are kept as separate tokens,
//! so nothing here quotes or escapes for a shell.

pub mod convert;
pub mod ffmpeg;
pub mod gifsicle;

use std::path::PathBuf;

use crate::config::PathSettings;
use crate::process::{
    CancelToken, ProcessExecutor, ProcessInvocation, ProcessOutcome, ProcessResult, ProgressSink,
};

/// Locations of the external executables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPaths {
    pub ffmpeg: PathBuf,
    pub convert: PathBuf,
    pub gifsicle: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self::from_settings(&PathSettings::default())
    }
}

impl ToolPaths {
    pub fn from_settings(paths: &PathSettings) -> Self {
        Self {
            ffmpeg: PathBuf::from(&paths.ffmpeg),
            convert: PathBuf::from(&paths.convert),
            gifsicle: PathBuf::from(&paths.gifsicle),
        }
    }
}

/// Everything needed to run a tool: executor, tool paths, progress, cancel.
#[derive(Clone, Copy)]
pub struct ExecContext<'a> {
    pub executor: &'a dyn ProcessExecutor,
    pub tools: &'a ToolPaths,
    pub sink: &'a dyn ProgressSink,
    pub cancel: &'a CancelToken,
}

impl<'a> ExecContext<'a> {
    pub fn new(
        executor: &'a dyn ProcessExecutor,
        tools: &'a ToolPaths,
        sink: &'a dyn ProgressSink,
        cancel: &'a CancelToken,
    ) -> Self {
        Self {
            executor,
            tools,
            sink,
            cancel,
        }
    }

    pub fn run(&self, invocation: &ProcessInvocation) -> ProcessResult<ProcessOutcome> {
        self.executor.execute(invocation, self.sink, self.cancel)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Linear map of `value` from `from` range onto `to` range.
pub fn rescale(value: f64, from: (f64, f64), to: (f64, f64)) -> f64 {
    let span = from.1 - from.0;
    if span == 0.0 {
        return to.0;
    }
    (value - from.0) * (to.1 - to.0) / span + to.0
}

/// Marker percent for the `index`th (1-based) item of `total`.
pub fn step_percent(index: usize, total: usize) -> i64 {
    if total == 0 {
        return 0;
    }
    ((index.saturating_sub(1)).min(total) * 100 / total) as i64
}
