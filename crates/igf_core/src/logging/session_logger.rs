//! Per-session diagnostic log.
//!
//! One file per work session, named `<name>-<YYYYmmdd-HHMMSS>.log`. Each
//! stage run is a block opened by [`SessionLogger::begin_stage`] and closed
//! by `finish_stage`, `fail_stage` or `cancel_stage`. Tool calls in between
//! are recorded with their command line and exit status, and their output
//! is kept so a failed stage can dump the last lines of it.
//!
//! ```text
//! 14:02:11.204     Run to Generate: Extract > Crop and Resize > Effects > Generate
//! 14:02:11.205     [Extract] >> never run
//! 14:02:11.205 dbg [Extract] $ "ffmpeg" "-v" "verbose" "-sn" ...
//! 14:02:13.870     [Extract] << 50 frame(s), 1 tool run(s) in 2.7s
//! ```

use std::collections::VecDeque;
use std::fmt::Display;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::Local;
use parking_lot::Mutex;

use super::types::{LogCallback, LogConfig, LogLevel, StageLog};
use crate::invalidation::{DirtyReason, Stage};
use crate::process::{ProcessInvocation, ProcessOutcome, ProgressSink, ProgressUpdate};

struct ActiveStage {
    stage: Stage,
    started: Instant,
    tools_run: usize,
    tools_failed: usize,
}

impl ActiveStage {
    fn summary(&self) -> StageLog {
        StageLog {
            stage: self.stage,
            tools_run: self.tools_run,
            tools_failed: self.tools_failed,
            elapsed: self.started.elapsed(),
        }
    }
}

#[derive(Default)]
struct LogState {
    writer: Option<BufWriter<File>>,
    active: Option<ActiveStage>,
    /// Tool output of the current stage, `label: line`.
    tail: VecDeque<String>,
    /// Label and percent of the last progress line written.
    progress: Option<(String, u32)>,
}

/// Session log shared by the controller and the stage runners.
///
/// All state sits behind one lock. The callback runs while it is held, so
/// it must not log back into the same logger.
pub struct SessionLogger {
    log_path: PathBuf,
    config: LogConfig,
    callback: Option<LogCallback>,
    state: Mutex<LogState>,
}

impl SessionLogger {
    /// Create a fresh log file in `log_dir`.
    pub fn new(
        name: &str,
        log_dir: impl AsRef<Path>,
        config: LogConfig,
        callback: Option<LogCallback>,
    ) -> std::io::Result<Self> {
        let log_dir = log_dir.as_ref();
        fs::create_dir_all(log_dir)?;

        let log_path = log_dir.join(format!(
            "{}-{}.log",
            file_stem(name),
            Local::now().format("%Y%m%d-%H%M%S")
        ));
        let writer = BufWriter::new(File::create(&log_path)?);

        Ok(Self {
            log_path,
            config,
            callback,
            state: Mutex::new(LogState {
                writer: Some(writer),
                ..Default::default()
            }),
        })
    }

    /// File this session writes to.
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn info(&self, message: &str) {
        self.write(LogLevel::Info, message);
    }

    pub fn debug(&self, message: &str) {
        self.write(LogLevel::Debug, message);
    }

    pub fn warn(&self, message: &str) {
        self.write(LogLevel::Warn, message);
    }

    pub fn error(&self, message: &str) {
        self.write(LogLevel::Error, message);
    }

    /// Header for one `process_up_to` call.
    pub fn run_started(&self, target: Stage, preview: bool, stages: &[Stage]) {
        let order: Vec<&str> = stages.iter().map(Stage::name).collect();
        self.info(&format!(
            "Run to {}{}: {}",
            target,
            if preview { " (preview)" } else { "" },
            order.join(" > ")
        ));
    }

    /// Open the block of `stage`. The failure tail starts empty.
    pub fn begin_stage(&self, stage: Stage, reasons: &[DirtyReason]) {
        let why: Vec<String> = reasons.iter().map(ToString::to_string).collect();
        let mut state = self.state.lock();
        state.tail.clear();
        state.progress = None;
        state.active = Some(ActiveStage {
            stage,
            started: Instant::now(),
            tools_run: 0,
            tools_failed: 0,
        });
        self.emit(&mut state, LogLevel::Info, &format!(">> {}", why.join("; ")));
    }

    /// Close the current stage block after success.
    pub fn finish_stage(&self, frames: usize) -> Option<StageLog> {
        let mut state = self.state.lock();
        let summary = state.active.as_ref()?.summary();
        let line = format!(
            "<< {} frame(s), {} tool run(s) in {:.1}s",
            frames,
            summary.tools_run,
            summary.elapsed.as_secs_f64()
        );
        self.emit(&mut state, LogLevel::Info, &line);
        state.active = None;
        Some(summary)
    }

    /// Close the current stage block with `error` and the output tail.
    pub fn fail_stage(&self, error: &dyn Display) -> Option<StageLog> {
        let mut state = self.state.lock();
        let summary = state.active.as_ref()?.summary();
        self.emit(&mut state, LogLevel::Error, &format!("!! {}", error));

        let tail: Vec<String> = state.tail.iter().cloned().collect();
        for line in tail {
            self.emit(&mut state, LogLevel::Error, &format!("   | {}", line));
        }
        state.active = None;
        if let Some(writer) = state.writer.as_mut() {
            let _ = writer.flush();
        }
        Some(summary)
    }

    /// Close the current stage block after a cancel request.
    pub fn cancel_stage(&self) -> Option<StageLog> {
        let mut state = self.state.lock();
        let summary = state.active.as_ref()?.summary();
        self.emit(&mut state, LogLevel::Warn, "!! cancelled");
        state.active = None;
        Some(summary)
    }

    /// Record the command line of a tool about to run.
    pub fn tool_started(&self, invocation: &ProcessInvocation) {
        let mut state = self.state.lock();
        if let Some(active) = state.active.as_mut() {
            active.tools_run += 1;
        }
        self.emit(
            &mut state,
            LogLevel::Debug,
            &format!("$ {}", invocation.command_line()),
        );
    }

    /// Record how a tool ended and keep its output for the failure tail.
    pub fn tool_finished(&self, invocation: &ProcessInvocation, outcome: &ProcessOutcome) {
        let label = invocation.label();
        let mut state = self.state.lock();

        let lines = outcome
            .combined_output()
            .lines()
            .map(str::trim_end)
            .filter(|l| !l.is_empty())
            .map(|l| format!("{}: {}", label, l))
            .collect::<Vec<_>>();
        for line in lines {
            if self.config.error_tail > 0 {
                if state.tail.len() >= self.config.error_tail {
                    state.tail.pop_front();
                }
                state.tail.push_back(line.clone());
            }
            if !self.config.compact {
                self.emit(&mut state, LogLevel::Debug, &line);
            }
        }

        if !outcome.success && !outcome.cancelled {
            if let Some(active) = state.active.as_mut() {
                active.tools_failed += 1;
            }
            let code = outcome
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            self.emit(
                &mut state,
                LogLevel::Warn,
                &format!("{} exited with {}", label, code),
            );
        }
    }

    /// Log `percent` for `label`. Compact mode skips lines that do not
    /// cross a `progress_step` boundary for the same tool.
    ///
    /// Returns true if a line was written.
    pub fn progress(&self, label: &str, percent: u32) -> bool {
        let mut state = self.state.lock();
        if self.config.compact {
            let step = self.config.progress_step.max(1);
            if let Some((last_label, last)) = &state.progress {
                let same_tool = last_label == label;
                if same_tool && (percent / step <= *last / step) && !(percent >= 100 && *last < 100)
                {
                    return false;
                }
            }
        }
        state.progress = Some((label.to_string(), percent));
        self.emit(
            &mut state,
            LogLevel::Info,
            &format!("{} {}%", label, percent),
        );
        true
    }

    /// Tool output kept for the current stage.
    pub fn tail(&self) -> Vec<String> {
        self.state.lock().tail.iter().cloned().collect()
    }

    /// Push buffered lines to disk.
    pub fn flush(&self) {
        if let Some(writer) = self.state.lock().writer.as_mut() {
            let _ = writer.flush();
        }
    }

    fn write(&self, level: LogLevel, message: &str) {
        let mut state = self.state.lock();
        self.emit(&mut state, level, message);
    }

    fn emit(&self, state: &mut LogState, level: LogLevel, message: &str) {
        if level < self.config.level {
            return;
        }
        let scope = state
            .active
            .as_ref()
            .map(|a| format!("[{}] ", a.stage))
            .unwrap_or_default();
        let line = format!(
            "{} {} {}{}",
            Local::now().format("%H:%M:%S%.3f"),
            level.tag(),
            scope,
            message
        );
        if let Some(writer) = state.writer.as_mut() {
            let _ = writeln!(writer, "{}", line);
        }
        if let Some(callback) = &self.callback {
            callback(&line);
        }
    }
}

impl ProgressSink for SessionLogger {
    fn on_progress(&self, update: &ProgressUpdate) {
        if let Some(percent) = update.progress.and_then(|p| p.percent()) {
            self.progress(&update.label, u32::from(percent));
        }
    }
}

impl Drop for SessionLogger {
    fn drop(&mut self) {
        self.flush();
    }
}

/// Name part of the log file: ASCII letters, digits, `-` and `_` only.
fn file_stem(name: &str) -> String {
    let stem: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    if stem.is_empty() {
        "session".to_string()
    } else {
        stem
    }
}
