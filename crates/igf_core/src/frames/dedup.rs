//! Duplicate frame detection by content hash.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use super::{FrameError, FrameResult, FrameSequenceStore};

/// Frames with identical content.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DuplicateReport {
    /// Every frame that repeats an earlier one, in sequence order.
    pub duplicates: Vec<PathBuf>,
    /// Groups of identical frames; the first entry of each is the one kept.
    pub groups: Vec<Vec<PathBuf>>,
}

impl DuplicateReport {
    /// No frame repeats another.
    pub fn is_empty(&self) -> bool {
        self.duplicates.is_empty()
    }

    /// Whether all `total` frames share one hash.
    pub fn all_identical(&self, total: usize) -> bool {
        total > 1 && self.groups.len() == 1 && self.groups[0].len() == total
    }
}

fn hash_file(path: &Path) -> io::Result<[u8; 32]> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hasher.finalize().into())
}

/// Group `frames` by content. Order of `frames` decides which copy is kept.
pub(super) fn find_duplicates(frames: &[PathBuf]) -> FrameResult<DuplicateReport> {
    let mut first_seen: HashMap<[u8; 32], usize> = HashMap::new();
    let mut groups: Vec<Vec<PathBuf>> = Vec::new();
    let mut duplicates = Vec::new();

    for path in frames {
        let hash = hash_file(path)
            .map_err(|e| FrameError::io(format!("hashing {}", path.display()), e))?;

        match first_seen.get(&hash) {
            Some(&group) => {
                groups[group].push(path.clone());
                duplicates.push(path.clone());
            }
            None => {
                first_seen.insert(hash, groups.len());
                groups.push(vec![path.clone()]);
            }
        }
    }

    groups.retain(|g| g.len() > 1);
    Ok(DuplicateReport { duplicates, groups })
}

impl FrameSequenceStore {
    /// Find repeated frames; with `cull`, delete all but the first of each
    /// group and re-enumerate.
    pub fn detect_duplicates(&self, cull: bool) -> FrameResult<DuplicateReport> {
        let frames = self.enumerate()?;
        let report = find_duplicates(&frames)?;

        if !report.is_empty() {
            tracing::info!(
                "{} duplicate frame(s) in {} group(s)",
                report.duplicates.len(),
                report.groups.len()
            );
        }

        if cull {
            self.cull_duplicates(&report)?;
        }

        Ok(report)
    }

    /// Delete the duplicates named in `report` and re-enumerate.
    ///
    /// Returns the number of frames removed.
    pub fn cull_duplicates(&self, report: &DuplicateReport) -> FrameResult<usize> {
        if report.is_empty() {
            return Ok(0);
        }
        for path in &report.duplicates {
            fs::remove_file(path)
                .map_err(|e| FrameError::io(format!("deleting {}", path.display()), e))?;
        }
        self.re_enumerate()?;
        Ok(report.duplicates.len())
    }
}
