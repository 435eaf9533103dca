//! Importing frames into an existing sequence.

use std::fs;
use std::path::{Path, PathBuf};

use super::store::CURRENT_STAGING;
use super::{run_tool, FrameError, FrameResult, FrameSequenceStore, FRAME_EXTENSION};
use crate::commands::{convert, step_percent, ExecContext};

const IMPORT_STAGING: &str = "imported";

/// One thing to import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportItem {
    /// An image file. Multi-frame files (GIF) expand to several frames.
    File(PathBuf),
    /// A solid frame of this ImageMagick color.
    Color(String),
}

impl ImportItem {
    /// `<color>` tokens are solid frames; anything else is a path.
    pub fn parse(token: &str) -> Self {
        match token.strip_prefix('<').and_then(|t| t.strip_suffix('>')) {
            Some(color) if !color.is_empty() => ImportItem::Color(color.to_string()),
            _ => ImportItem::File(PathBuf::from(token)),
        }
    }

    fn sort_key(&self) -> String {
        match self {
            ImportItem::File(p) => p.to_string_lossy().to_string(),
            ImportItem::Color(c) => format!("<{}>", c),
        }
    }
}

/// Where and how to insert imported frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpliceRequest {
    pub items: Vec<ImportItem>,
    /// Number of existing frames kept before the new ones (0 = at the front).
    pub after: usize,
    /// Insert the new frames in reverse order.
    pub reverse: bool,
    /// Alternate new and existing frames instead of inserting a block.
    pub riffle: bool,
    /// Letterbox instead of stretching.
    pub keep_aspect: bool,
    /// Frame size imports are fitted to.
    pub size: (u32, u32),
}

impl SpliceRequest {
    /// Block insert after frame `after`, stretched to `size`.
    pub fn new(items: Vec<ImportItem>, after: usize, size: (u32, u32)) -> Self {
        Self {
            items,
            after,
            reverse: false,
            riffle: false,
            keep_aspect: true,
            size,
        }
    }
}

/// What a splice changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpliceReport {
    /// Frames added.
    pub inserted: usize,
    /// Import files that did not exist.
    pub skipped: Vec<PathBuf>,
    /// Frame count afterwards.
    pub total: usize,
}

/// An existing frame moved (or copied) aside during a splice.
struct Staged {
    original: PathBuf,
    staged: PathBuf,
}

/// Final order: `after` existing frames, then the new frames either as a
/// block or interleaved (new first) with the remaining existing frames.
fn splice_order<T: Clone>(current: &[T], new: &[T], after: usize, riffle: bool) -> Vec<T> {
    let after = after.min(current.len());
    let (head, rest) = current.split_at(after);
    let mut order = head.to_vec();

    if riffle {
        for i in 0..new.len().max(rest.len()) {
            order.extend(new.get(i).cloned());
            order.extend(rest.get(i).cloned());
        }
    } else {
        order.extend_from_slice(new);
        order.extend_from_slice(rest);
    }
    order
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

fn is_gif(path: &Path) -> bool {
    path.extension()
        .is_some_and(|e| e.to_string_lossy().eq_ignore_ascii_case("gif"))
}

impl FrameSequenceStore {
    fn import_slot(&self, slot: usize) -> PathBuf {
        self.dir()
            .join(format!("{}_{:04}.{}", IMPORT_STAGING, slot, FRAME_EXTENSION))
    }

    /// Insert imported frames and renumber.
    ///
    /// Any fatal error restores the original frames and removes partial
    /// imports. Missing import files are skipped and reported.
    pub fn splice(
        &self,
        request: &SpliceRequest,
        ctx: &ExecContext<'_>,
    ) -> FrameResult<SpliceReport> {
        if request.items.is_empty() {
            return Err(FrameError::EmptyImport);
        }

        let current = self.enumerate()?;
        if request.after > current.len() {
            return Err(FrameError::InvalidRange {
                start: request.after,
                end: request.after,
                count: current.len(),
            });
        }
        self.ensure_dir()?;

        let mut items = request.items.clone();
        items.sort_by_key(ImportItem::sort_key);

        tracing::info!(
            "Import {} item(s) after frame {}",
            items.len(),
            request.after
        );

        let mut staged = Vec::with_capacity(current.len());
        for (i, path) in current.iter().enumerate() {
            let to = self
                .dir()
                .join(format!("{}_{:04}.{}", CURRENT_STAGING, i + 1, FRAME_EXTENSION));
            let named = items
                .iter()
                .any(|item| matches!(item, ImportItem::File(p) if same_file(p, path)));

            let moved = if named {
                fs::copy(path, &to).map(|_| ())
            } else {
                fs::rename(path, &to)
            };
            if let Err(e) = moved {
                self.rollback_splice(&staged);
                return Err(FrameError::io(format!("staging {}", path.display()), e));
            }
            staged.push(Staged {
                original: path.clone(),
                staged: to,
            });
        }

        let mut skipped = Vec::new();
        let imported = match self.import_items(&items, request, ctx, &mut skipped) {
            Ok(imported) if imported.is_empty() => {
                self.rollback_splice(&staged);
                return Err(FrameError::EmptyImport);
            }
            Ok(imported) => imported,
            Err(e) => {
                self.rollback_splice(&staged);
                return Err(e);
            }
        };

        // Frames that were import sources were copied; drop the originals
        // before the final names are handed out.
        for s in &staged {
            if s.original.exists() {
                if let Err(e) = fs::remove_file(&s.original) {
                    self.rollback_splice(&staged);
                    return Err(FrameError::io(
                        format!("removing {}", s.original.display()),
                        e,
                    ));
                }
            }
        }

        let mut new_frames = imported;
        if request.reverse {
            new_frames.reverse();
        }

        let existing: Vec<PathBuf> = staged.iter().map(|s| s.staged.clone()).collect();
        let order = splice_order(&existing, &new_frames, request.after, request.riffle);

        ctx.sink.on_finished();
        if let Err(e) = self.renumber(&order, "renum") {
            self.rollback_splice(&staged);
            return Err(e);
        }

        Ok(SpliceReport {
            inserted: new_frames.len(),
            skipped,
            total: order.len(),
        })
    }

    /// Produce `imported_%04d.png` files in item order.
    fn import_items(
        &self,
        items: &[ImportItem],
        request: &SpliceRequest,
        ctx: &ExecContext<'_>,
        skipped: &mut Vec<PathBuf>,
    ) -> FrameResult<Vec<PathBuf>> {
        let (width, height) = request.size;
        let total = items.len();
        let mut imported = Vec::new();
        let mut slot = 1;

        for (k, item) in items.iter().enumerate() {
            if ctx.is_cancelled() {
                return Err(FrameError::Cancelled);
            }
            let out = self.import_slot(slot);

            match item {
                ImportItem::Color(color) => {
                    let invocation = convert::blank_frame(ctx.tools, width, height, color, &out)?;
                    run_tool(ctx, &invocation)?;
                    if !out.exists() {
                        return Err(FrameError::ImportFailed(format!(
                            "Couldn't create blank {} frame",
                            color
                        )));
                    }
                    imported.push(out);
                    slot += 1;
                }
                ImportItem::File(src) => {
                    if !src.is_file() {
                        tracing::warn!("Import file {} does not exist", src.display());
                        skipped.push(src.clone());
                        continue;
                    }

                    // Multi-frame sources block for a long time with no
                    // meaningful percentage.
                    let percent = if is_gif(src) {
                        -1
                    } else {
                        step_percent(k + 1, total)
                    };
                    let invocation = convert::import_frame(
                        ctx.tools,
                        src,
                        width,
                        height,
                        request.keep_aspect,
                        percent,
                        &out,
                    )?;
                    run_tool(ctx, &invocation).map_err(|e| match e {
                        FrameError::ToolFailed { output, .. } => FrameError::ImportFailed(
                            format!("Unable to resize {}: {}", src.display(), output),
                        ),
                        other => other,
                    })?;

                    if out.exists() {
                        imported.push(out);
                        slot += 1;
                        continue;
                    }

                    let fanned = self.collect_fan_out(&out, &mut slot)?;
                    if fanned.is_empty() {
                        return Err(FrameError::ImportFailed(format!(
                            "No frames produced from {}",
                            src.display()
                        )));
                    }
                    imported.extend(fanned);
                }
            }
        }

        Ok(imported)
    }

    /// Rename `stem-0.png`, `stem-1.png`, ... written for a multi-frame
    /// source into consecutive import slots.
    fn collect_fan_out(&self, out: &Path, slot: &mut usize) -> FrameResult<Vec<PathBuf>> {
        let stem = out
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();

        let mut collected = Vec::new();
        for sub in 0.. {
            let sub_file = self
                .dir()
                .join(format!("{}-{}.{}", stem, sub, FRAME_EXTENSION));
            if !sub_file.exists() {
                break;
            }
            let to = self.import_slot(*slot);
            fs::rename(&sub_file, &to)
                .map_err(|e| FrameError::io(format!("moving {}", sub_file.display()), e))?;
            collected.push(to);
            *slot += 1;
        }
        Ok(collected)
    }

    /// Put staged frames back and drop partial imports.
    fn rollback_splice(&self, staged: &[Staged]) {
        tracing::warn!("Import failed, restoring {} frame(s)", staged.len());

        for path in self.list_with_prefix(IMPORT_STAGING).unwrap_or_default() {
            if let Err(e) = fs::remove_file(&path) {
                tracing::error!("Unable to remove {}: {}", path.display(), e);
            }
        }

        for s in staged {
            let restored = if s.original.exists() {
                fs::remove_file(&s.staged)
            } else {
                fs::rename(&s.staged, &s.original)
            };
            if let Err(e) = restored {
                tracing::error!("Unable to restore {}: {}", s.original.display(), e);
            }
        }
    }
}
