//! Core types for the stage pipeline.

use std::fs;
use std::path::{Path, PathBuf};

use crate::commands::ExecContext;
use crate::config::Settings;
use crate::frames::FrameSequenceStore;
use crate::invalidation::{EditConflict, Stage};
use crate::logging::SessionLogger;
use crate::media::{MediaSource, VideoParams};
use crate::process::{ProcessInvocation, ProcessOutcome};

use super::errors::{StageError, StageResult};

/// Directory holding single-frame previews.
const PREVIEW_DIR: &str = "preview";

/// Directories of one work session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkLayout {
    root: PathBuf,
}

impl WorkLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Frame store of `stage`, `None` for stages that produce a file.
    pub fn store(&self, stage: Stage) -> Option<FrameSequenceStore> {
        stage
            .dir_name()
            .map(|name| FrameSequenceStore::new(self.root.join(name)))
    }

    pub fn preview_dir(&self) -> PathBuf {
        self.root.join(PREVIEW_DIR)
    }

    /// Fully rendered preview frame.
    pub fn preview_file(&self) -> PathBuf {
        self.preview_dir().join("preview.png")
    }

    /// Create every stage directory.
    pub fn ensure(&self) -> std::io::Result<()> {
        for stage in Stage::ALL {
            if let Some(name) = stage.dir_name() {
                fs::create_dir_all(self.root.join(name))?;
            }
        }
        fs::create_dir_all(self.preview_dir())
    }
}

/// Read-only context passed to stage runners.
pub struct StageContext<'a> {
    pub settings: &'a Settings,
    pub source: &'a MediaSource,
    pub params: &'a VideoParams,
    pub layout: &'a WorkLayout,
    pub exec: ExecContext<'a>,
    pub logger: &'a SessionLogger,
}

impl<'a> StageContext<'a> {
    /// Frame store of a frame-producing stage.
    pub fn store(&self, stage: Stage) -> StageResult<FrameSequenceStore> {
        self.layout
            .store(stage)
            .ok_or_else(|| StageError::invalid_input(format!("{} has no frame directory", stage)))
    }

    pub fn check_cancelled(&self) -> StageResult<()> {
        if self.exec.is_cancelled() {
            Err(StageError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Run a tool; nonzero exit is an error.
    pub fn run(&self, invocation: &ProcessInvocation) -> StageResult<ProcessOutcome> {
        let outcome = self.run_lenient(invocation)?;
        if !outcome.success {
            return Err(StageError::ToolFailed {
                tool: invocation.label().to_string(),
                exit_code: outcome.exit_code,
                output: outcome.combined_output(),
            });
        }
        Ok(outcome)
    }

    /// Run a tool; only cancellation is an error.
    pub fn run_lenient(&self, invocation: &ProcessInvocation) -> StageResult<ProcessOutcome> {
        self.logger.tool_started(invocation);
        let outcome = self.exec.run(invocation)?;
        self.logger.tool_finished(invocation, &outcome);
        if outcome.cancelled {
            return Err(StageError::Cancelled);
        }
        Ok(outcome)
    }
}

/// What one stage run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub stage: Stage,
    /// Frames in the stage directory afterwards.
    pub frames: usize,
    /// Inputs that failed and were left out.
    pub skipped_items: usize,
    /// Frames removed as duplicates.
    pub duplicates_removed: usize,
    /// External tool runs the stage made.
    pub tools_run: usize,
    /// Output file, for the final stage.
    pub output: Option<PathBuf>,
}

impl StageReport {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            frames: 0,
            skipped_items: 0,
            duplicates_removed: 0,
            tools_run: 0,
            output: None,
        }
    }
}

/// Result of one `process_up_to` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub target: Stage,
    pub preview: bool,
    /// Stages that ran, in order.
    pub stages: Vec<StageReport>,
    /// Conflicts the resolver was asked about.
    pub conflicts: Vec<EditConflict>,
    /// The resolver chose to keep manual edits.
    pub edits_kept: bool,
}

impl RunReport {
    pub fn new(target: Stage, preview: bool) -> Self {
        Self {
            target,
            preview,
            stages: Vec::new(),
            conflicts: Vec::new(),
            edits_kept: false,
        }
    }

    pub fn ran(&self, stage: Stage) -> bool {
        self.stages.iter().any(|r| r.stage == stage)
    }

    pub fn stages_run(&self) -> Vec<Stage> {
        self.stages.iter().map(|r| r.stage).collect()
    }

    /// Output file written by this run, if it reached the final stage.
    pub fn output(&self) -> Option<&Path> {
        self.stages.iter().rev().find_map(|r| r.output.as_deref())
    }

    pub fn was_noop(&self) -> bool {
        self.stages.is_empty()
    }
}
