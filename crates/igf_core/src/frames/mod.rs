//! Numbered frame sequences on disk.
//!
//! A stage directory holds `image0001.png`, `image0002.png`, ... with no gaps.
//! [`FrameSequenceStore`] is the only writer of those names: every operation
//! that removes, inserts or reorders frames ends with a re-enumeration so the
//! sequence is contiguous again before anyone reads it.

mod crossfade;
mod dedup;
mod splice;
mod store;

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::commands::ExecContext;
use crate::process::{ProcessError, ProcessInvocation};

pub use crossfade::{plan_cross_fade, BlendStep, CrossFadePlan};
pub use dedup::DuplicateReport;
pub use splice::{ImportItem, SpliceReport, SpliceRequest};
pub use store::{ExportReport, ExportRequest, FrameSequenceStore};

/// Filename prefix of a stable frame.
pub const FRAME_PREFIX: &str = "image";

/// Frame file extension.
pub const FRAME_EXTENSION: &str = "png";

/// `image%04d.png` name of 1-based frame `index`.
pub fn frame_name(index: usize) -> String {
    format!("{}{:04}.{}", FRAME_PREFIX, index, FRAME_EXTENSION)
}

/// Errors from frame sequence operations.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("I/O error in {operation}: {source}")]
    Io {
        operation: String,
        #[source]
        source: io::Error,
    },

    /// Renaming failed partway. Frames may need manual recovery when
    /// `rolled_back` is false.
    #[error("Failed to re-enumerate frames after moving {moved} file(s) (rolled back: {rolled_back}): {source}")]
    ReEnumerationFailed {
        moved: usize,
        rolled_back: bool,
        #[source]
        source: io::Error,
    },

    #[error("Frame range {start}..={end} is outside 1..={count}")]
    InvalidRange {
        start: usize,
        end: usize,
        count: usize,
    },

    #[error("Cross-fade needs at least 3 frames, got {frames}")]
    CrossFadeTooShort { frames: usize },

    #[error("Nothing to import")]
    EmptyImport,

    #[error("Import failed: {0}")]
    ImportFailed(String),

    #[error("{label} failed (exit code {exit_code:?}): {output}")]
    ToolFailed {
        label: String,
        exit_code: Option<i32>,
        output: String,
    },

    #[error("Frame operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Process(#[from] ProcessError),
}

impl FrameError {
    /// I/O failure while `operation` was under way.
    pub fn io(operation: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }
}

/// Result of a frame directory operation.
pub type FrameResult<T> = Result<T, FrameError>;

/// Run one invocation; cancellation and nonzero exit become errors.
pub(crate) fn run_tool(ctx: &ExecContext<'_>, invocation: &ProcessInvocation) -> FrameResult<()> {
    tracing::debug!("Running: {}", invocation.command_line());
    let outcome = ctx.run(invocation)?;
    if outcome.cancelled {
        return Err(FrameError::Cancelled);
    }
    if !outcome.success {
        return Err(FrameError::ToolFailed {
            label: invocation.label().to_string(),
            exit_code: outcome.exit_code,
            output: outcome.tail(5).join("\n"),
        });
    }
    Ok(())
}

/// Paths sorted by file name.
pub(crate) fn sorted(mut paths: Vec<PathBuf>) -> Vec<PathBuf> {
    paths.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    paths
}
