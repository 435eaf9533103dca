//! Change counters, stage timestamps and plan resolution.

use std::collections::{BTreeMap, BTreeSet};
use std::time::SystemTime;

use super::{DirtyReason, EditConflict, SettingsCategory, Stage, StageGraph, StageState};

/// Number of field changes per category since the consuming stage last ran.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeCounters {
    counts: BTreeMap<SettingsCategory, u32>,
}

impl ChangeCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a diff as produced by `Settings::category_changes`.
    pub fn record(&mut self, changes: &BTreeMap<SettingsCategory, u32>) {
        for (category, n) in changes {
            if *n > 0 {
                *self.counts.entry(*category).or_insert(0) += n;
            }
        }
    }

    pub fn get(&self, category: SettingsCategory) -> u32 {
        self.counts.get(&category).copied().unwrap_or(0)
    }

    pub fn clear(&mut self, category: SettingsCategory) {
        self.counts.remove(&category);
    }

    /// Categories of `stage` with pending changes.
    pub fn pending_for(&self, stage: Stage) -> Vec<SettingsCategory> {
        stage
            .consumes()
            .iter()
            .copied()
            .filter(|c| self.get(*c) > 0)
            .collect()
    }

    pub fn is_clean(&self) -> bool {
        self.counts.values().all(|n| *n == 0)
    }
}

/// When a stage last completed and what its output looked like then.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageTimestamp {
    /// Wall-clock time of the last successful run.
    pub completed_at: Option<SystemTime>,
    /// On-disk modification time right after the pipeline's own writes.
    pub observed_on_disk: Option<SystemTime>,
}

/// Current state of a stage's output on disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageObservation {
    /// Latest modification time of the output, `None` if it does not exist.
    pub on_disk: Option<SystemTime>,
    /// The output exists and is non-empty.
    pub has_output: bool,
}

/// Stages to run for one target, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagePlan {
    pub target: Option<Stage>,
    pub stages: Vec<(Stage, Vec<DirtyReason>)>,
    pub conflicts: Vec<EditConflict>,
}

impl StagePlan {
    pub fn stages_to_run(&self) -> Vec<Stage> {
        self.stages.iter().map(|(s, _)| *s).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

/// Decides which stages are stale.
#[derive(Debug, Clone, Default)]
pub struct StageInvalidationTracker {
    graph: StageGraph,
    counters: ChangeCounters,
    timestamps: BTreeMap<Stage, StageTimestamp>,
    states: BTreeMap<Stage, StageState>,
}

impl StageInvalidationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn graph(&self) -> &StageGraph {
        &self.graph
    }

    pub fn counters(&self) -> &ChangeCounters {
        &self.counters
    }

    pub fn record_changes(&mut self, changes: &BTreeMap<SettingsCategory, u32>) {
        if !changes.is_empty() {
            tracing::debug!("Settings changes: {:?}", changes);
        }
        self.counters.record(changes);
    }

    pub fn timestamp(&self, stage: Stage) -> StageTimestamp {
        self.timestamps.get(&stage).copied().unwrap_or_default()
    }

    /// Last known state; never-seen stages are clean.
    pub fn state(&self, stage: Stage) -> StageState {
        self.states.get(&stage).copied().unwrap_or_default()
    }

    /// Work out what must run to bring `target` up to date.
    ///
    /// `observe` reports each stage's current output on disk.
    pub fn plan(&self, target: Stage, observe: impl Fn(Stage) -> StageObservation) -> StagePlan {
        let mut plan = StagePlan {
            target: Some(target),
            ..Default::default()
        };
        let mut forced_by: Option<Stage> = None;

        for stage in self.graph.path_to(target) {
            let ts = self.timestamp(stage);
            let obs = observe(stage);
            let mut reasons = Vec::new();

            if let Some(earlier) = forced_by {
                reasons.push(DirtyReason::Forced(earlier));
            }
            if self.state(stage) == StageState::Failed {
                reasons.push(DirtyReason::PreviouslyFailed);
            }

            match ts.completed_at {
                None => reasons.push(DirtyReason::NeverRun),
                Some(done) => {
                    if !obs.has_output {
                        reasons.push(DirtyReason::OutputMissing);
                    }
                    for &up in self.graph.upstream(stage) {
                        if self.timestamp(up).completed_at.is_some_and(|t| t > done) {
                            reasons.push(DirtyReason::UpstreamNewer(up));
                        }
                        if observe(up).on_disk.is_some_and(|t| t > done) {
                            reasons.push(DirtyReason::UpstreamEditedOnDisk(up));
                        }
                    }
                }
            }

            let pending = self.counters.pending_for(stage);
            if !pending.is_empty() {
                let edited = match (ts.observed_on_disk, obs.on_disk) {
                    (Some(seen), Some(now)) => now > seen,
                    _ => false,
                };
                if edited && ts.completed_at.is_some() {
                    plan.conflicts.push(EditConflict {
                        stage,
                        categories: pending.clone(),
                    });
                }
                reasons.push(DirtyReason::SettingsChanged(pending));
            }

            if !reasons.is_empty() {
                forced_by.get_or_insert(stage);
                plan.stages.push((stage, reasons));
            }
        }

        plan
    }

    /// User chose to keep manual edits: forget the conflicting changes.
    pub fn keep_edits(&mut self, conflicts: &[EditConflict]) {
        for conflict in conflicts {
            for category in &conflict.categories {
                tracing::info!(
                    "Keeping edited {} frames, ignoring {} changes",
                    conflict.stage,
                    category
                );
                self.counters.clear(*category);
            }
        }
    }

    /// Flag `stage` stale. A failed stage keeps its failed state.
    pub fn mark_dirty(&mut self, stage: Stage) {
        if self.state(stage) != StageState::Failed {
            self.states.insert(stage, StageState::Dirty);
        }
    }

    /// Frames of `stage` were edited in place: every stage built from them
    /// is now stale. Returns the stages marked.
    pub fn frames_edited(&mut self, stage: Stage) -> BTreeSet<Stage> {
        let stale = self.graph.descendants(stage);
        for &s in &stale {
            self.mark_dirty(s);
        }
        stale
    }

    pub fn mark_running(&mut self, stage: Stage) {
        self.states.insert(stage, StageState::Running);
    }

    /// Record a successful run. Preview runs leave the counters alone.
    pub fn mark_succeeded(
        &mut self,
        stage: Stage,
        completed_at: SystemTime,
        observed_on_disk: Option<SystemTime>,
        reset_counters: bool,
    ) {
        self.timestamps.insert(
            stage,
            StageTimestamp {
                completed_at: Some(completed_at),
                observed_on_disk,
            },
        );
        self.states.insert(stage, StageState::Clean);
        if reset_counters {
            for category in stage.consumes() {
                self.counters.clear(*category);
            }
        }
    }

    /// Record a failed or cancelled run. The stage output is gone.
    pub fn mark_failed(&mut self, stage: Stage) {
        self.timestamps.insert(stage, StageTimestamp::default());
        self.states.insert(stage, StageState::Failed);
    }

    /// Forget everything, e.g. when the source changes.
    pub fn reset(&mut self) {
        self.counters = ChangeCounters::new();
        self.timestamps.clear();
        self.states.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn at(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn present(secs: u64) -> StageObservation {
        StageObservation {
            on_disk: Some(at(secs)),
            has_output: true,
        }
    }

    /// Tracker with every stage completed at 10, 20, 30, 40 and disk times
    /// equal to completion.
    fn settled() -> StageInvalidationTracker {
        let mut tracker = StageInvalidationTracker::new();
        for (i, stage) in Stage::ALL.iter().enumerate() {
            let t = at(10 * (i as u64 + 1));
            tracker.mark_succeeded(*stage, t, Some(t), true);
        }
        tracker
    }

    fn settled_disk(stage: Stage) -> StageObservation {
        present(10 * (stage as u64 + 1))
    }

    #[test]
    fn fresh_tracker_runs_everything() {
        let tracker = StageInvalidationTracker::new();
        let plan = tracker.plan(Stage::Generated, |_| StageObservation::default());
        assert_eq!(plan.stages_to_run(), Stage::ALL.to_vec());
        assert_eq!(plan.stages[0].1, vec![DirtyReason::NeverRun]);
    }

    #[test]
    fn settled_tracker_runs_nothing() {
        let tracker = settled();
        assert!(tracker.plan(Stage::Generated, settled_disk).is_empty());
    }

    #[test]
    fn effects_change_runs_only_downstream() {
        let mut tracker = settled();
        let mut changes = BTreeMap::new();
        changes.insert(SettingsCategory::ColorEffects, 2);
        tracker.record_changes(&changes);

        let plan = tracker.plan(Stage::Generated, settled_disk);
        assert_eq!(
            plan.stages_to_run(),
            vec![Stage::Processed, Stage::Generated]
        );
        assert_eq!(plan.stages[1].1, vec![DirtyReason::Forced(Stage::Processed)]);
        assert!(plan.conflicts.is_empty());
    }

    #[test]
    fn target_limits_plan() {
        let mut tracker = settled();
        let mut changes = BTreeMap::new();
        changes.insert(SettingsCategory::OutputFormat, 1);
        tracker.record_changes(&changes);

        assert!(tracker.plan(Stage::Processed, settled_disk).is_empty());
        assert_eq!(
            tracker.plan(Stage::Generated, settled_disk).stages_to_run(),
            vec![Stage::Generated]
        );
    }

    #[test]
    fn upstream_disk_edit_dirties_downstream() {
        let tracker = settled();
        let plan = tracker.plan(Stage::Generated, |stage| match stage {
            Stage::Extracted => present(25),
            other => settled_disk(other),
        });
        assert_eq!(plan.stages[0].0, Stage::Resized);
        assert_eq!(
            plan.stages[0].1,
            vec![DirtyReason::UpstreamEditedOnDisk(Stage::Extracted)]
        );
    }

    #[test]
    fn settings_change_over_manual_edit_conflicts() {
        let mut tracker = settled();
        let mut changes = BTreeMap::new();
        changes.insert(SettingsCategory::SizeCrop, 1);
        tracker.record_changes(&changes);

        let observe = |stage| match stage {
            Stage::Resized => present(35),
            other => settled_disk(other),
        };
        let plan = tracker.plan(Stage::Generated, observe);
        assert_eq!(plan.conflicts.len(), 1);
        assert_eq!(plan.conflicts[0].stage, Stage::Resized);

        tracker.keep_edits(&plan.conflicts);
        let replanned = tracker.plan(Stage::Generated, observe);
        assert!(replanned.conflicts.is_empty());
        // Processed still reacts to the edited resized frames.
        assert_eq!(replanned.stages[0].0, Stage::Processed);
    }

    #[test]
    fn missing_output_and_failure_dirty_stage() {
        let mut tracker = settled();
        tracker.mark_failed(Stage::Processed);
        let plan = tracker.plan(Stage::Generated, |stage| match stage {
            Stage::Generated => StageObservation::default(),
            other => settled_disk(other),
        });
        assert_eq!(plan.stages[0].0, Stage::Processed);
        assert!(plan.stages[0].1.contains(&DirtyReason::PreviouslyFailed));
        assert!(plan.stages[0].1.contains(&DirtyReason::NeverRun));
    }

    #[test]
    fn frame_edit_dirties_everything_downstream() {
        let mut tracker = settled();
        tracker.mark_failed(Stage::Generated);

        let stale = tracker.frames_edited(Stage::Resized);

        assert_eq!(
            stale.into_iter().collect::<Vec<_>>(),
            vec![Stage::Processed, Stage::Generated]
        );
        assert_eq!(tracker.state(Stage::Resized), StageState::Clean);
        assert_eq!(tracker.state(Stage::Processed), StageState::Dirty);
        // A failed stage stays failed.
        assert_eq!(tracker.state(Stage::Generated), StageState::Failed);
    }

    #[test]
    fn preview_success_keeps_counters() {
        let mut tracker = settled();
        let mut changes = BTreeMap::new();
        changes.insert(SettingsCategory::ColorEffects, 1);
        tracker.record_changes(&changes);

        tracker.mark_succeeded(Stage::Processed, at(50), Some(at(50)), false);
        assert_eq!(tracker.counters().get(SettingsCategory::ColorEffects), 1);

        tracker.mark_succeeded(Stage::Processed, at(60), Some(at(60)), true);
        assert!(tracker.counters().is_clean());
    }
}
