//! Error types for the stage pipeline.
//!
//! Errors carry context that chains through layers:
//! Pipeline → Stage → Operation → Detail

use std::io;

use thiserror::Error;

use crate::frames::FrameError;
use crate::invalidation::Stage;
use crate::media::MediaError;
use crate::process::ProcessError;

/// Top-level pipeline error.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A stage failed during execution.
    #[error("{stage} failed: {source}")]
    StageFailed {
        stage: Stage,
        #[source]
        source: StageError,
    },

    /// Settings or inputs were rejected before anything ran.
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// The run was cancelled.
    #[error("Cancelled{}", .stage.map(|s| format!(" during {}", s)).unwrap_or_default())]
    Cancelled { stage: Option<Stage> },

    /// Work directories or the source could not be prepared.
    #[error("Setup failed: {0}")]
    SetupFailed(String),

    /// The user declined to continue.
    #[error("Declined: {0}")]
    Declined(String),
}

impl PipelineError {
    pub fn stage_failed(stage: Stage, source: StageError) -> Self {
        Self::StageFailed { stage, source }
    }

    pub fn validation_failed(message: impl Into<String>) -> Self {
        Self::ValidationFailed(message.into())
    }

    pub fn setup_failed(message: impl Into<String>) -> Self {
        Self::SetupFailed(message.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// One message suitable for showing to the user.
    pub fn user_message(&self) -> String {
        match self {
            PipelineError::StageFailed { stage, source } => {
                let mut message = format!(
                    "A problem occurred during {}: {}",
                    stage_activity(*stage),
                    source
                );
                if let Some(hint) = source.tool_output().and_then(diagnose) {
                    message.push_str("\n\n");
                    message.push_str(hint);
                }
                message
            }
            PipelineError::Cancelled { .. } => "Cancelled".to_string(),
            other => other.to_string(),
        }
    }
}

fn stage_activity(stage: Stage) -> &'static str {
    match stage {
        Stage::Extracted => "frame extraction",
        Stage::Resized => "cropping and resizing",
        Stage::Processed => "applying effects",
        Stage::Generated => "output creation",
    }
}

/// Error from one stage.
#[derive(Error, Debug)]
pub enum StageError {
    #[error("Input validation failed: {0}")]
    InvalidInput(String),

    #[error("Output validation failed: {0}")]
    InvalidOutput(String),

    /// A tool exited nonzero.
    #[error("{tool} failed with exit code {}", .exit_code.map(|c| c.to_string()).unwrap_or_else(|| "unknown".to_string()))]
    ToolFailed {
        tool: String,
        exit_code: Option<i32>,
        output: String,
    },

    /// Extraction produced nothing; the message says why.
    #[error("{0}")]
    NoFrames(String),

    #[error("I/O error in {operation}: {source}")]
    Io {
        operation: String,
        #[source]
        source: io::Error,
    },

    #[error("Cancelled")]
    Cancelled,

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Frames(FrameError),

    #[error(transparent)]
    Media(#[from] MediaError),
}

impl From<FrameError> for StageError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Cancelled => StageError::Cancelled,
            FrameError::ToolFailed {
                label,
                exit_code,
                output,
            } => StageError::ToolFailed {
                tool: label,
                exit_code,
                output,
            },
            other => StageError::Frames(other),
        }
    }
}

impl StageError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn invalid_output(message: impl Into<String>) -> Self {
        Self::InvalidOutput(message.into())
    }

    pub fn io_error(operation: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            StageError::Cancelled | StageError::Media(MediaError::Cancelled)
        )
    }

    /// Captured tool output, if this error came from a tool.
    pub fn tool_output(&self) -> Option<&str> {
        match self {
            StageError::ToolFailed { output, .. } => Some(output),
            _ => None,
        }
    }
}

/// Known tool failures and what to tell the user about them.
const KNOWN_FAILURES: &[(&str, &str)] = &[
    (
        "Invalid data found when processing input",
        "Unsupported file type or DRM-protected.",
    ),
    (
        "No such file or directory",
        "A file the tool needed could not be found.",
    ),
    (
        "Permission denied",
        "Permission denied. Check that the output folder is writable.",
    ),
    ("No space left on device", "The disk is full."),
    (
        "no decode delegate",
        "ImageMagick cannot read this image format.",
    ),
    (
        "unable to read font",
        "A caption font could not be found. Pick another font.",
    ),
    (
        "Unknown encoder",
        "This ffmpeg build lacks the encoder needed for the output format.",
    ),
];

/// Interpret tool output, if it contains a known failure.
pub fn diagnose(output: &str) -> Option<&'static str> {
    KNOWN_FAILURES
        .iter()
        .find(|(needle, _)| output.contains(needle))
        .map(|(_, hint)| *hint)
}

pub type StageResult<T> = Result<T, StageError>;

pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_error_displays_context() {
        let err = StageError::ToolFailed {
            tool: "Crop and Resize".to_string(),
            exit_code: Some(1),
            output: String::new(),
        };
        assert_eq!(err.to_string(), "Crop and Resize failed with exit code 1");
    }

    #[test]
    fn user_message_adds_hint() {
        let err = PipelineError::stage_failed(
            Stage::Extracted,
            StageError::ToolFailed {
                tool: "Extract".to_string(),
                exit_code: Some(1),
                output: "clip.mp4: Invalid data found when processing input".to_string(),
            },
        );
        let msg = err.user_message();
        assert!(msg.contains("frame extraction"));
        assert!(msg.contains("DRM-protected"));
    }

    #[test]
    fn frame_cancellation_maps_to_stage_cancellation() {
        let err: StageError = FrameError::Cancelled.into();
        assert!(err.is_cancelled());
    }

    #[test]
    fn cancelled_display_names_stage() {
        let err = PipelineError::Cancelled {
            stage: Some(Stage::Resized),
        };
        assert_eq!(err.to_string(), "Cancelled during Crop and Resize");
        assert_eq!(
            PipelineError::Cancelled { stage: None }.to_string(),
            "Cancelled"
        );
    }

    #[test]
    fn unknown_output_has_no_hint() {
        assert!(diagnose("all good").is_none());
    }
}
