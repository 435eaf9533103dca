//! Source media description and probing.

pub mod probe;
pub mod timecode;

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::process::ProcessError;

pub use probe::{parse_probe_output, probe_media, VideoParams, FALLBACK_FPS};
pub use timecode::{duration_secs, format_duration_ms, parse_duration_ms};

/// Extensions treated as still images when building a source.
const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "bmp", "tif", "tiff", "webp"];

/// Errors from media handling.
#[derive(Error, Debug)]
pub enum MediaError {
    #[error("'{0}' does not exist!")]
    NotFound(PathBuf),

    #[error("'{0}' has an unsupported file extension")]
    UnsupportedExtension(PathBuf),

    #[error("Image sequence is empty")]
    EmptySequence,

    #[error("Probe failed: {0}")]
    ProbeFailed(String),

    #[error("Probe cancelled")]
    Cancelled,

    #[error(transparent)]
    Process(#[from] ProcessError),
}

pub type MediaResult<T> = Result<T, MediaError>;

/// What the pipeline extracts frames from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaSource {
    /// A single video file.
    Video(PathBuf),
    /// Still images in display order.
    ImageSequence(Vec<PathBuf>),
}

impl MediaSource {
    /// Classify inputs: several files or image extensions make a sequence.
    pub fn from_inputs(inputs: Vec<PathBuf>) -> MediaResult<Self> {
        match inputs.len() {
            0 => Err(MediaError::EmptySequence),
            1 if !is_image_path(&inputs[0]) => Ok(Self::Video(inputs[0].clone())),
            _ => Ok(Self::ImageSequence(inputs)),
        }
    }

    pub fn is_video(&self) -> bool {
        matches!(self, Self::Video(_))
    }

    /// File handed to `ffmpeg -i` for probing.
    pub fn probe_path(&self) -> MediaResult<&Path> {
        match self {
            Self::Video(p) => Ok(p),
            Self::ImageSequence(list) => list
                .first()
                .map(PathBuf::as_path)
                .ok_or(MediaError::EmptySequence),
        }
    }

    /// Number of input files (1 for video).
    pub fn input_count(&self) -> usize {
        match self {
            Self::Video(_) => 1,
            Self::ImageSequence(list) => list.len(),
        }
    }
}

/// Whether `path` has a still-image extension.
pub fn is_image_path(path: &Path) -> bool {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_video_is_video() {
        let src = MediaSource::from_inputs(vec![PathBuf::from("clip.MP4")]).unwrap();
        assert!(src.is_video());
        assert_eq!(src.probe_path().unwrap(), Path::new("clip.MP4"));
    }

    #[test]
    fn images_form_a_sequence() {
        let src = MediaSource::from_inputs(vec![PathBuf::from("a.PNG")]).unwrap();
        assert!(!src.is_video());

        let src =
            MediaSource::from_inputs(vec![PathBuf::from("a.png"), PathBuf::from("b.png")]).unwrap();
        assert_eq!(src.input_count(), 2);
    }

    #[test]
    fn empty_input_is_rejected() {
        assert!(matches!(
            MediaSource::from_inputs(Vec::new()),
            Err(MediaError::EmptySequence)
        ));
    }
}
