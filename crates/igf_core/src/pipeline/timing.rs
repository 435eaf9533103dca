//! Playback timing and output naming.

use std::path::{Path, PathBuf};

use crate::config::OutputKind;

/// Smallest GIF frame delay most viewers honor, in centiseconds.
pub const MIN_GIF_DELAY: f64 = 2.0;

/// GIF frame delay in centiseconds for `frame_rate` and `speed_modifier`.
///
/// Negative modifiers slow playback twice as fast as positive ones speed
/// it up.
pub fn gif_frame_delay(frame_rate: u32, speed_modifier: i32) -> f64 {
    let ticks_per_frame = (100 / frame_rate.max(1)) as f64;
    let mut delay = ticks_per_frame;
    let norm = 1.0 + speed_modifier.unsigned_abs() as f64 * ticks_per_frame / 10.0;

    if speed_modifier < 0 {
        delay += (norm * 2.0).trunc();
    } else if speed_modifier > 0 {
        delay -= norm;
    }

    delay.max(MIN_GIF_DELAY)
}

/// Delay as passed to `convert -delay`.
pub fn gif_delay_centiseconds(delay: f64) -> u32 {
    delay.trunc() as u32
}

/// Playback length in seconds of `frames` frames at `delay` centiseconds.
pub fn total_runtime_secs(delay: f64, frames: usize) -> f64 {
    delay * 10.0 / 1000.0 * frames as f64
}

/// Input frame rate that plays frames at `delay` centiseconds each.
pub fn video_input_fps(delay: f64) -> f64 {
    1.0 / (delay * 10.0 / 1000.0)
}

/// Path to write for `base`.
///
/// With `overwrite`, `base` itself (extension forced to `kind`). Otherwise
/// the first free `stem001.ext`, `stem002.ext`, ... beside it.
pub fn next_output_path(base: &Path, kind: OutputKind, overwrite: bool) -> PathBuf {
    let target = base.with_extension(kind.extension());
    if overwrite {
        return target;
    }

    let dir = target.parent().map(Path::to_path_buf).unwrap_or_default();
    let stem = target
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "animation".to_string());

    (1..)
        .map(|idx| dir.join(format!("{}{:03}.{}", stem, idx, kind.extension())))
        .find(|candidate| !candidate.exists())
        .unwrap_or(target)
}
