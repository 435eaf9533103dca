//! Frame directory listing, renumbering and bulk file operations.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::{
    frame_name, run_tool, sorted, FrameError, FrameResult, FRAME_EXTENSION, FRAME_PREFIX,
};
use crate::commands::{convert, step_percent, ExecContext};

/// Staging prefix used by [`FrameSequenceStore::re_enumerate`].
const RENUMBER_STAGING: &str = "renum";

/// Staging prefix used by [`FrameSequenceStore::reverse`] and splicing.
pub(super) const CURRENT_STAGING: &str = "current";

/// Frames to copy out of a stage directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportRequest {
    /// First frame, 1-based.
    pub start: usize,
    /// Last frame, inclusive.
    pub end: usize,
    /// Destination folder, created if missing.
    pub dest: PathBuf,
    /// Copies are named `{prefix}0001.png`, `{prefix}0002.png`, ...
    pub prefix: String,
    /// Rotation applied to every copy. Multiples of 360 leave the copy alone.
    pub rotate_degrees: i32,
}

impl ExportRequest {
    /// Unrotated copies named `frame0001.png`, ...
    pub fn new(start: usize, end: usize, dest: impl Into<PathBuf>) -> Self {
        Self {
            start,
            end,
            dest: dest.into(),
            prefix: "frame".to_string(),
            rotate_degrees: 0,
        }
    }

    fn rotates(&self) -> bool {
        self.rotate_degrees.rem_euclid(360) != 0
    }
}

/// Result of [`FrameSequenceStore::export`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExportReport {
    /// Files written, in frame order.
    pub exported: Vec<PathBuf>,
    /// Frames that could not be copied, with the reason.
    pub failed: Vec<(PathBuf, String)>,
}

/// One stage directory of numbered frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSequenceStore {
    dir: PathBuf,
}

impl FrameSequenceStore {
    /// Store over `dir`. Nothing is created until a write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the directory if missing.
    pub fn ensure_dir(&self) -> FrameResult<()> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| FrameError::io(format!("creating {}", self.dir.display()), e))
    }

    /// Path of 1-based frame `index` (whether or not it exists).
    pub fn frame_path(&self, index: usize) -> PathBuf {
        self.dir.join(frame_name(index))
    }

    /// `image%04d.png` output pattern for tools that number their output.
    pub fn pattern(&self) -> PathBuf {
        self.dir
            .join(format!("{}%04d.{}", FRAME_PREFIX, FRAME_EXTENSION))
    }

    /// `image*.png` glob, expanded by ImageMagick.
    pub fn glob(&self) -> PathBuf {
        self.dir.join(format!("{}*.{}", FRAME_PREFIX, FRAME_EXTENSION))
    }

    /// Frames currently on disk, sorted by name. A missing directory is empty.
    pub fn enumerate(&self) -> FrameResult<Vec<PathBuf>> {
        self.list_with_prefix(FRAME_PREFIX)
    }

    /// Number of frames on disk.
    pub fn count(&self) -> FrameResult<usize> {
        Ok(self.enumerate()?.len())
    }

    pub fn is_empty(&self) -> FrameResult<bool> {
        Ok(self.count()? == 0)
    }

    pub(super) fn list_with_prefix(&self, prefix: &str) -> FrameResult<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(FrameError::io(
                    format!("listing {}", self.dir.display()),
                    e,
                ))
            }
        };

        let suffix = format!(".{}", FRAME_EXTENSION);
        let paths = entries
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(prefix) && n.ends_with(&suffix))
            })
            .collect();
        Ok(sorted(paths))
    }

    /// Rename frames so they are numbered 1..=n in their current order.
    ///
    /// Returns the frame count.
    pub fn re_enumerate(&self) -> FrameResult<usize> {
        let frames = self.enumerate()?;
        let in_place = frames
            .iter()
            .enumerate()
            .all(|(i, p)| *p == self.frame_path(i + 1));
        if in_place {
            return Ok(frames.len());
        }

        tracing::info!(
            "Re-enumerate {} files in {}",
            frames.len(),
            self.dir.display()
        );
        self.renumber(&frames, RENUMBER_STAGING)
    }

    /// Reverse frame order.
    pub fn reverse(&self) -> FrameResult<usize> {
        let mut frames = self.enumerate()?;
        frames.reverse();
        tracing::info!("Reverse {} frames", frames.len());
        self.renumber(&frames, CURRENT_STAGING)
    }

    /// Give `order[i]` the name of frame `i + 1`.
    ///
    /// Files move to `{staging}_%04d.png` first so no rename overwrites a
    /// frame that has not moved yet. On failure every completed move is
    /// undone where possible.
    pub(super) fn renumber(&self, order: &[PathBuf], staging: &str) -> FrameResult<usize> {
        let staged: Vec<(PathBuf, PathBuf)> = order
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let name = format!("{}_{:04}.{}", staging, i + 1, FRAME_EXTENSION);
                (p.clone(), self.dir.join(name))
            })
            .collect();

        if let Err((done, source)) = rename_all(&staged) {
            let rolled_back = undo_renames(&staged[..done]);
            return Err(FrameError::ReEnumerationFailed {
                moved: done,
                rolled_back,
                source,
            });
        }

        let finals: Vec<(PathBuf, PathBuf)> = staged
            .iter()
            .enumerate()
            .map(|(i, (_, s))| (s.clone(), self.frame_path(i + 1)))
            .collect();

        if let Err((done, source)) = rename_all(&finals) {
            let rolled_back = undo_renames(&finals[..done]) && undo_renames(&staged);
            return Err(FrameError::ReEnumerationFailed {
                moved: staged.len() + done,
                rolled_back,
                source,
            });
        }

        Ok(order.len())
    }

    /// Delete frames `start..=end` (1-based) and close the gap.
    pub fn delete_range(&self, start: usize, end: usize) -> FrameResult<usize> {
        let frames = self.enumerate()?;
        check_range(start, end, frames.len())?;

        for path in &frames[start - 1..end] {
            fs::remove_file(path)
                .map_err(|e| FrameError::io(format!("deleting {}", path.display()), e))?;
        }
        tracing::info!("Deleted frames {} to {}", start, end);

        self.re_enumerate()?;
        Ok(end - start + 1)
    }

    /// Remove every file in the directory. The directory itself stays.
    pub fn clear(&self) -> FrameResult<usize> {
        self.ensure_dir()?;
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| FrameError::io(format!("listing {}", self.dir.display()), e))?;

        let mut removed = 0;
        for path in entries.filter_map(Result::ok).map(|e| e.path()) {
            if path.is_file() {
                fs::remove_file(&path)
                    .map_err(|e| FrameError::io(format!("deleting {}", path.display()), e))?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Latest modification time of the directory or anything in it.
    pub fn last_modified(&self) -> Option<SystemTime> {
        let mut latest = fs::metadata(&self.dir).and_then(|m| m.modified()).ok()?;
        if let Ok(entries) = fs::read_dir(&self.dir) {
            for entry in entries.filter_map(Result::ok) {
                if let Ok(modified) = entry.metadata().and_then(|m| m.modified()) {
                    latest = latest.max(modified);
                }
            }
        }
        Some(latest)
    }

    /// Copy the requested frames out, rotating each copy when asked.
    ///
    /// A frame that fails to copy or rotate is recorded in the report and
    /// its copy removed. Cancellation stops the export with an error.
    pub fn export(
        &self,
        request: &ExportRequest,
        ctx: &ExecContext<'_>,
    ) -> FrameResult<ExportReport> {
        let frames = self.enumerate()?;
        let (start, end) = (request.start, request.end);
        check_range(start, end, frames.len())?;
        fs::create_dir_all(&request.dest)
            .map_err(|e| FrameError::io(format!("creating {}", request.dest.display()), e))?;

        tracing::info!(
            "Export frames {} to {} (rotate {})",
            start,
            end,
            request.rotate_degrees
        );

        let total = end - start + 1;
        let mut report = ExportReport::default();
        for (n, from) in frames[start - 1..end].iter().enumerate() {
            if ctx.is_cancelled() {
                return Err(FrameError::Cancelled);
            }
            let to = request
                .dest
                .join(format!("{}{:04}.{}", request.prefix, n + 1, FRAME_EXTENSION));

            if let Err(e) = fs::copy(from, &to) {
                tracing::warn!("Unable to export {}: {}", from.display(), e);
                report.failed.push((from.clone(), e.to_string()));
                continue;
            }

            if request.rotates() {
                let invocation = convert::rotate(
                    ctx.tools,
                    &to,
                    request.rotate_degrees,
                    step_percent(n + 1, total),
                )?;
                match run_tool(ctx, &invocation) {
                    Ok(()) => {}
                    Err(FrameError::Cancelled) => {
                        let _ = fs::remove_file(&to);
                        return Err(FrameError::Cancelled);
                    }
                    Err(e) => {
                        tracing::warn!("Unable to rotate {}: {}", to.display(), e);
                        let _ = fs::remove_file(&to);
                        report.failed.push((from.clone(), e.to_string()));
                        continue;
                    }
                }
            }
            report.exported.push(to);
        }

        if request.rotates() {
            ctx.sink.on_finished();
        }
        Ok(report)
    }
}

pub(super) fn check_range(start: usize, end: usize, count: usize) -> FrameResult<()> {
    if start == 0 || start > end || end > count {
        return Err(FrameError::InvalidRange { start, end, count });
    }
    Ok(())
}

/// Rename each `(from, to)` pair in order; on error report how many moved.
fn rename_all(pairs: &[(PathBuf, PathBuf)]) -> Result<(), (usize, io::Error)> {
    for (done, (from, to)) in pairs.iter().enumerate() {
        fs::rename(from, to).map_err(|e| (done, e))?;
    }
    Ok(())
}

/// Reverse completed renames, newest first. True if all were undone.
fn undo_renames(pairs: &[(PathBuf, PathBuf)]) -> bool {
    let mut clean = true;
    for (from, to) in pairs.iter().rev() {
        if let Err(e) = fs::rename(to, from) {
            tracing::error!(
                "Unable to restore {} from {}: {}",
                from.display(),
                to.display(),
                e
            );
            clean = false;
        }
    }
    clean
}
