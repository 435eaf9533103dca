//! Video parameter probing from the `ffmpeg -i` banner.
//!
//! `ffmpeg -i <file>` with no output always exits nonzero, so the exit code
//! is ignored and the combined output is parsed instead.

use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;

use super::timecode::{format_duration_ms, parse_duration_ms};
use super::{MediaError, MediaResult, MediaSource};
use crate::process::{
    CancelToken, NullSink, ProcessExecutor, ProcessInvocation, SilentTranslator,
};

/// Frame rate assumed when none can be read (image sequences).
pub const FALLBACK_FPS: f64 = 10.0;

/// Extensions that are never treated as media.
const REJECTED_EXTENSIONS: &[&str] = &["exe", "bat"];

static SIZE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Stream.*Video.* ([0-9]+)x([0-9]+)").expect("valid regex"));

static ASPECT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Stream #0.+Video.+\[SAR (\d+):(\d+) DAR (\d+):(\d+)\]").expect("valid regex")
});

static ROTATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s+rotate\s+:\s+(90|270|-90|-270)").expect("valid regex"));

static DURATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Duration: ([0-9.:]+),").expect("valid regex"));

static FPS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Video:.+?([0-9.]+) tbr").expect("valid regex"));

/// Display parameters of the source media.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoParams {
    /// Display width (after aspect correction and rotation).
    pub width: u32,
    /// Display height.
    pub height: u32,
    /// Length in milliseconds; `None` for image sequences.
    pub duration_ms: Option<u64>,
    /// Frames per second as reported by the container.
    pub fps: f64,
}

impl VideoParams {
    /// Frame rate rounded to a whole number, at least 1.
    pub fn fps_rounded(&self) -> u32 {
        if self.fps < 1.0 {
            1
        } else {
            self.fps.round() as u32
        }
    }

    /// Length in seconds rounded to one decimal place.
    pub fn length_secs(&self) -> f64 {
        self.duration_ms
            .map(|ms| (ms as f64 / 100.0).round() / 10.0)
            .unwrap_or(0.0)
    }

    /// `HH:MM:SS.mmm` length, if known.
    pub fn length_str(&self) -> Option<String> {
        self.duration_ms.map(format_duration_ms)
    }
}

/// Parse `ffmpeg -i` output.
///
/// `is_video` controls whether duration and frame rate are trusted; image
/// inputs report meaningless values for both.
pub fn parse_probe_output(output: &str, is_video: bool) -> MediaResult<VideoParams> {
    let caps = SIZE_RE
        .captures(output)
        .ok_or_else(|| MediaError::ProbeFailed("Unable to get video width and height parameters.".to_string()))?;

    let mut width: f64 = caps[1].parse().map_err(|_| MediaError::ProbeFailed("bad width".to_string()))?;
    let mut height: f64 = caps[2].parse().map_err(|_| MediaError::ProbeFailed("bad height".to_string()))?;

    if let Some(caps) = ASPECT_RE.captures(output) {
        let nums: Vec<f64> = (1..=4).filter_map(|i| caps[i].parse::<f64>().ok()).collect();
        if nums.len() == 4 && nums[1] > 0.0 && nums[3] > 0.0 {
            let sar = nums[0] / nums[1];
            let dar = nums[2] / nums[3];
            if sar != 1.0 && dar != sar {
                tracing::info!(
                    "Storage aspect ratio ({:.2}) differs from display aspect ratio ({:.2})",
                    sar,
                    dar
                );
                width = height * dar;
            }
        }
    }

    if ROTATE_RE.is_match(output) {
        tracing::info!("Side rotation detected");
        std::mem::swap(&mut width, &mut height);
    }

    let duration_ms = if is_video {
        DURATION_RE
            .captures(output)
            .and_then(|c| parse_duration_ms(&c[1]))
    } else {
        None
    };

    let fps = if is_video {
        FPS_RE
            .captures(output)
            .and_then(|c| c[1].parse::<f64>().ok())
            .filter(|f| *f > 0.0)
    } else {
        None
    };

    let fps = fps.unwrap_or_else(|| {
        tracing::info!(
            "Unable to determine frame rate! Arbitrarily setting it to {}",
            FALLBACK_FPS
        );
        FALLBACK_FPS
    });

    let params = VideoParams {
        width: width as u32,
        height: height as u32,
        duration_ms,
        fps,
    };

    tracing::info!(
        "Video Parameters: {}x{} ({:.3}:1); {} fps",
        params.width,
        params.height,
        params.width as f64 / params.height.max(1) as f64,
        params.fps_rounded()
    );

    Ok(params)
}

/// Check the media exists and has an acceptable extension.
pub fn validate_media_path(path: &Path) -> MediaResult<()> {
    if let Some(ext) = path.extension().map(|e| e.to_string_lossy().to_lowercase()) {
        if REJECTED_EXTENSIONS.contains(&ext.as_str()) {
            return Err(MediaError::UnsupportedExtension(path.to_path_buf()));
        }
    }
    if !path.exists() {
        return Err(MediaError::NotFound(path.to_path_buf()));
    }
    Ok(())
}

/// Probe the source with `ffmpeg -i`.
pub fn probe_media(
    executor: &dyn ProcessExecutor,
    ffmpeg: &Path,
    source: &MediaSource,
    cancel: &CancelToken,
) -> MediaResult<VideoParams> {
    let path = source.probe_path()?;
    validate_media_path(path)?;

    tracing::info!("Extracting video information from {}", path.display());

    let invocation = ProcessInvocation::builder(ffmpeg)
        .label("Probe")
        .arg("-i")
        .arg(path)
        .translator(std::sync::Arc::new(SilentTranslator))
        .finalize_progress(false)
        .build()?;

    let outcome = executor.execute(&invocation, &NullSink, cancel)?;
    if outcome.cancelled {
        return Err(MediaError::Cancelled);
    }

    parse_probe_output(&outcome.combined_output(), source.is_video())
}
