//! Recording fake executor used by unit tests across the crate.

use std::fs;
use std::path::PathBuf;

use parking_lot::Mutex;

use super::cancel::{CancelToken, ProgressSink};
use super::invocation::ProcessInvocation;
use super::runner::ProcessExecutor;
use super::types::{ProcessError, ProcessOutcome, ProcessResult};

type FailPredicate = Box<dyn Fn(&ProcessInvocation) -> bool + Send + Sync>;

/// One call seen by [`RecordingExecutor`].
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub program: String,
    pub args: Vec<String>,
}

impl RecordedCall {
    pub fn has_arg(&self, needle: &str) -> bool {
        self.args.iter().any(|a| a == needle)
    }
}

/// Executor that pretends to be the real tools.
///
/// The last argument is treated as the output path. A `%04d` pattern
/// produces `pattern_frames` numbered files; anything else produces one file
/// whose content is the command line, so every output is distinct.
pub struct RecordingExecutor {
    calls: Mutex<Vec<RecordedCall>>,
    pattern_frames: Mutex<usize>,
    fail_when: Option<FailPredicate>,
    cancel_on_call: Option<usize>,
}

impl Default for RecordingExecutor {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            pattern_frames: Mutex::new(5),
            fail_when: None,
            cancel_on_call: None,
        }
    }
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pattern_frames(self, frames: usize) -> Self {
        *self.pattern_frames.lock() = frames;
        self
    }

    pub fn failing_when(
        mut self,
        predicate: impl Fn(&ProcessInvocation) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.fail_when = Some(Box::new(predicate));
        self
    }

    /// Cancel the token during the `n`th call (1-based).
    pub fn cancelling_on_call(mut self, n: usize) -> Self {
        self.cancel_on_call = Some(n);
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }
}

impl ProcessExecutor for RecordingExecutor {
    fn execute(
        &self,
        invocation: &ProcessInvocation,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> ProcessResult<ProcessOutcome> {
        if cancel.is_cancelled() {
            return Ok(ProcessOutcome {
                cancelled: true,
                ..Default::default()
            });
        }

        let call_number = {
            let mut calls = self.calls.lock();
            calls.push(RecordedCall {
                program: invocation.program().display().to_string(),
                args: invocation
                    .args()
                    .iter()
                    .map(|a| a.to_string_lossy().to_string())
                    .collect(),
            });
            calls.len()
        };

        if self.cancel_on_call == Some(call_number) {
            cancel.cancel();
            return Ok(ProcessOutcome {
                cancelled: true,
                ..Default::default()
            });
        }

        if self.fail_when.as_ref().is_some_and(|f| f(invocation)) {
            return Ok(ProcessOutcome {
                success: false,
                exit_code: Some(1),
                stderr: "simulated failure".to_string(),
                ..Default::default()
            });
        }

        let program = invocation.program().display().to_string();
        let io_err = |source| ProcessError::Io {
            program: program.clone(),
            source,
        };

        if let Some(output) = invocation.output_arg() {
            let output = output.to_string_lossy().to_string();
            if output.contains("%04d") {
                let frames = *self.pattern_frames.lock();
                for i in 1..=frames {
                    let path = PathBuf::from(output.replace("%04d", &format!("{:04}", i)));
                    fs::write(&path, format!("frame {} of {}", i, invocation.command_line()))
                        .map_err(io_err)?;
                }
            } else if !output.starts_with('-') {
                fs::write(&output, invocation.command_line()).map_err(io_err)?;
            }
        }

        if invocation.finalizes_progress() {
            sink.on_finished();
        }

        Ok(ProcessOutcome {
            success: true,
            exit_code: Some(0),
            ..Default::default()
        })
    }
}
