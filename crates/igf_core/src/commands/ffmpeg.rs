//! ffmpeg invocations: frame extraction and video encoding.

use std::path::{Path, PathBuf};

use super::ToolPaths;
use crate::config::OutputKind;
use crate::process::{ProcessInvocation, ProcessResult};

/// Output frame rate of encoded video.
pub const VIDEO_OUTPUT_FPS: u32 = 30;

/// Audio added to an encoded video.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioTrack {
    pub path: PathBuf,
    /// Offset into the audio file, passed to `-ss` as-is.
    pub start: String,
    /// Percent.
    pub volume: u32,
}

/// Extract `duration_sec` seconds from `start` at `fps` into `pattern`.
///
/// Option order matters to ffmpeg: `-t` and `-ss` before `-i` seek the input.
pub fn extract_frames(
    tools: &ToolPaths,
    video: &Path,
    start: &str,
    duration_sec: f64,
    fps: u32,
    pattern: &Path,
) -> ProcessResult<ProcessInvocation> {
    ProcessInvocation::builder(&tools.ffmpeg)
        .label("Extract")
        .args(["-v", "verbose", "-sn", "-t"])
        .arg(format!("{:.1}", duration_sec))
        .arg("-ss")
        .arg(start)
        .arg("-i")
        .arg(video)
        .arg("-r")
        .arg(fps.to_string())
        .arg(pattern)
        .build()
}

/// Encode numbered frames into MP4 or WebM.
pub fn encode_video(
    tools: &ToolPaths,
    frames_pattern: &Path,
    input_fps: f64,
    kind: OutputKind,
    audio: Option<&AudioTrack>,
    output: &Path,
) -> ProcessResult<ProcessInvocation> {
    let mut builder = ProcessInvocation::builder(&tools.ffmpeg)
        .label("Encode")
        .args(["-v", "verbose", "-y", "-r"])
        .arg(format!("{:.2}", input_fps))
        .args(["-start_number", "1", "-i"])
        .arg(frames_pattern);

    builder = match audio {
        Some(track) => {
            let codec: &[&str] = match kind {
                OutputKind::WebM => &["libvorbis"],
                _ => &["aac", "-strict", "experimental"],
            };
            builder
                .arg("-ss")
                .arg(&track.start)
                .arg("-i")
                .arg(&track.path)
                .arg("-af")
                .arg(format!("volume={:.2}", track.volume as f64 / 100.0))
                .arg("-c:a")
                .args(codec)
                .args(["-b:a", "128k"])
        }
        None => builder.args(["-f", "lavfi", "-i", "aevalsrc=0"]),
    };

    builder = match kind {
        OutputKind::Mp4 => builder.args([
            "-c:v",
            "libx264",
            "-crf",
            "18",
            "-preset",
            "slow",
            "-vf",
            "scale=trunc(in_w/2)*2:trunc(in_h/2)*2,setsar=1:1",
            "-pix_fmt",
            "yuv420p",
        ]),
        OutputKind::WebM => {
            builder.args(["-c:v", "libvpx", "-crf", "4", "-b:v", "312.5k", "-vf", "setsar=1:1"])
        }
        OutputKind::Gif => builder.args(["-vf", "setsar=1:1"]),
    };

    builder
        .arg("-shortest")
        .arg("-r")
        .arg(VIDEO_OUTPUT_FPS.to_string())
        .arg(output)
        .build()
}
