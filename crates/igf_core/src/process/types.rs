//! Types shared by the process execution engine.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Progress reported by an external tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressValue {
    /// Tool is working but the duration is unknown (`-1` in marker comments).
    Busy,
    /// Percent complete, clamped to 0..=100.
    Percent(u8),
}

impl ProgressValue {
    /// Build from a raw marker value. Negative values mean "busy".
    pub fn from_raw(raw: i64) -> Self {
        if raw < 0 {
            ProgressValue::Busy
        } else {
            ProgressValue::Percent(raw.min(100) as u8)
        }
    }

    /// Percent, if known.
    pub fn percent(&self) -> Option<u8> {
        match self {
            ProgressValue::Busy => None,
            ProgressValue::Percent(p) => Some(*p),
        }
    }
}

/// One progress tick delivered to a [`ProgressSink`](super::ProgressSink).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    /// Label of the invocation that produced this update.
    pub label: String,
    /// Last known progress (persists across ticks with no match).
    pub progress: Option<ProgressValue>,
    /// Human-readable status, if the translator produced one this tick.
    pub status: Option<String>,
}

/// Result of running one external process to completion (or cancellation).
#[derive(Debug, Clone, Default)]
pub struct ProcessOutcome {
    /// Exit code 0 and not cancelled.
    pub success: bool,
    /// Exit code, if the process exited normally.
    pub exit_code: Option<i32>,
    /// Everything read from stdout.
    pub stdout: String,
    /// Everything read from stderr.
    pub stderr: String,
    /// The caller cancelled the run.
    pub cancelled: bool,
}

impl ProcessOutcome {
    /// Combined output, stdout first.
    pub fn combined_output(&self) -> String {
        let mut out = String::with_capacity(self.stdout.len() + self.stderr.len() + 1);
        out.push_str(&self.stdout);
        if !self.stdout.is_empty() && !self.stderr.is_empty() && !self.stdout.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(&self.stderr);
        out
    }

    /// Last `n` non-empty lines of combined output.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let combined = self.combined_output();
        let lines: Vec<&str> = combined
            .split(['\n', '\r'])
            .map(str::trim_end)
            .filter(|l| !l.is_empty())
            .collect();
        let start = lines.len().saturating_sub(n);
        lines[start..].iter().map(|s| s.to_string()).collect()
    }
}

/// Errors from the process engine.
///
/// A nonzero exit code is not an error: it is returned as an unsuccessful
/// [`ProcessOutcome`] so the caller can interpret tool-specific failures.
#[derive(Error, Debug)]
pub enum ProcessError {
    /// The executable could not be located.
    #[error("Executable not found: {program}")]
    ToolNotFound { program: PathBuf },

    /// The invocation was rejected before spawning.
    #[error("Invalid invocation for {program}: {message}")]
    InvalidInvocation { program: String, message: String },

    /// Spawning failed.
    #[error("Failed to start {program}: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: io::Error,
    },

    /// Communication with the child failed.
    #[error("I/O error while running {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// Result type for process operations.
pub type ProcessResult<T> = Result<T, ProcessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_raw_progress_is_busy() {
        assert_eq!(ProgressValue::from_raw(-1), ProgressValue::Busy);
        assert_eq!(ProgressValue::from_raw(0), ProgressValue::Percent(0));
        assert_eq!(ProgressValue::from_raw(250), ProgressValue::Percent(100));
        assert_eq!(ProgressValue::Busy.percent(), None);
    }

    #[test]
    fn tail_skips_blank_lines() {
        let outcome = ProcessOutcome {
            stdout: "a\n\nb\n".to_string(),
            stderr: "c\rd\n".to_string(),
            ..Default::default()
        };
        assert_eq!(outcome.tail(2), vec!["c".to_string(), "d".to_string()]);
        assert_eq!(outcome.tail(10).len(), 4);
    }
}
