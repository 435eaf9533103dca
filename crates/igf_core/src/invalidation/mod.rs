//! Stage invalidation: which stages must run to bring a target up to date.
//!
//! Four stages form a chain; each consumes one settings category. Settings
//! edits are counted per category, completion times and on-disk times are
//! tracked per stage, and a plan for a target stage lists every stage that
//! needs to run with the reasons why.

mod graph;
mod tracker;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use graph::StageGraph;
pub use tracker::{
    ChangeCounters, StageInvalidationTracker, StageObservation, StagePlan, StageTimestamp,
};

/// Pipeline stage, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Frames pulled from the source into `original/`.
    Extracted,
    /// Cropped and resized frames in `resized/`.
    Resized,
    /// Frames with effects and captions in `processed/`.
    Processed,
    /// The final GIF or video file.
    Generated,
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::Extracted,
        Stage::Resized,
        Stage::Processed,
        Stage::Generated,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Extracted => "Extract",
            Stage::Resized => "Crop and Resize",
            Stage::Processed => "Effects",
            Stage::Generated => "Generate",
        }
    }

    /// Frame directory under the work dir; `None` for the output stage.
    pub fn dir_name(&self) -> Option<&'static str> {
        match self {
            Stage::Extracted => Some("original"),
            Stage::Resized => Some("resized"),
            Stage::Processed => Some("processed"),
            Stage::Generated => None,
        }
    }

    /// Settings categories whose changes dirty this stage.
    pub fn consumes(&self) -> &'static [SettingsCategory] {
        match self {
            Stage::Extracted => &[SettingsCategory::TimeRate],
            Stage::Resized => &[SettingsCategory::SizeCrop],
            Stage::Processed => &[SettingsCategory::ColorEffects],
            Stage::Generated => &[SettingsCategory::OutputFormat],
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Group of settings consumed by one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingsCategory {
    /// Start time, duration, frame rate.
    TimeRate,
    /// Crop rectangle and output size.
    SizeCrop,
    /// Color effects, captions, palette.
    ColorEffects,
    /// Output container, playback, audio.
    OutputFormat,
}

impl SettingsCategory {
    pub fn name(&self) -> &'static str {
        match self {
            SettingsCategory::TimeRate => "time and frame rate",
            SettingsCategory::SizeCrop => "size and crop",
            SettingsCategory::ColorEffects => "effects",
            SettingsCategory::OutputFormat => "output",
        }
    }
}

impl fmt::Display for SettingsCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Lifecycle of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StageState {
    #[default]
    Clean,
    Dirty,
    Running,
    Failed,
}

/// Why a stage has to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirtyReason {
    /// No successful run yet.
    NeverRun,
    /// Completed before, but the output is gone.
    OutputMissing,
    /// Consumed settings changed since the last run.
    SettingsChanged(Vec<SettingsCategory>),
    /// An upstream stage completed more recently.
    UpstreamNewer(Stage),
    /// An upstream directory was modified after this stage completed.
    UpstreamEditedOnDisk(Stage),
    /// An earlier stage in this run executes.
    Forced(Stage),
    /// The last attempt failed.
    PreviouslyFailed,
}

impl fmt::Display for DirtyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DirtyReason::NeverRun => write!(f, "never run"),
            DirtyReason::OutputMissing => write!(f, "output missing"),
            DirtyReason::SettingsChanged(cats) => {
                let names: Vec<&str> = cats.iter().map(SettingsCategory::name).collect();
                write!(f, "{} settings changed", names.join(", "))
            }
            DirtyReason::UpstreamNewer(s) => write!(f, "{} is newer", s),
            DirtyReason::UpstreamEditedOnDisk(s) => write!(f, "{} frames were edited", s),
            DirtyReason::Forced(s) => write!(f, "{} runs first", s),
            DirtyReason::PreviouslyFailed => write!(f, "previous attempt failed"),
        }
    }
}

/// A stage whose settings changed while its frames were edited by hand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditConflict {
    pub stage: Stage,
    pub categories: Vec<SettingsCategory>,
}

/// Decisions the pipeline needs from the user.
pub trait ConflictResolver {
    /// All conflicts of one run, asked once. `true` re-runs the stages and
    /// discards the manual edits; `false` keeps the edits and forgets the
    /// settings changes.
    fn confirm_discard_edits(&self, conflicts: &[EditConflict]) -> bool;

    /// Whether to go ahead with an output of `frames` frames, above the
    /// configured `threshold`.
    fn confirm_large_output(&self, _frames: u32, _threshold: u32) -> bool {
        true
    }
}

/// Resolver with fixed answers, for headless use.
#[derive(Debug, Clone, Copy)]
pub struct FixedResolver {
    pub discard_edits: bool,
    pub allow_large_output: bool,
}

impl Default for FixedResolver {
    fn default() -> Self {
        Self {
            discard_edits: true,
            allow_large_output: true,
        }
    }
}

impl ConflictResolver for FixedResolver {
    fn confirm_discard_edits(&self, conflicts: &[EditConflict]) -> bool {
        if !conflicts.is_empty() {
            tracing::info!(
                "{} conflict(s) resolved as {}",
                conflicts.len(),
                if self.discard_edits { "discard edits" } else { "keep edits" }
            );
        }
        self.discard_edits
    }

    fn confirm_large_output(&self, _frames: u32, _threshold: u32) -> bool {
        self.allow_large_output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_stage_consumes_one_category() {
        let mut seen: Vec<SettingsCategory> =
            Stage::ALL.iter().flat_map(|s| s.consumes().iter().copied()).collect();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 4);
    }

    #[test]
    fn reason_display_names_categories() {
        let reason = DirtyReason::SettingsChanged(vec![SettingsCategory::ColorEffects]);
        assert_eq!(reason.to_string(), "effects settings changed");
    }
}
