//! Pipeline controller: decides what is stale and runs it.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use super::errors::{PipelineError, PipelineResult, StageError, StageResult};
use super::stages::runner_for;
use super::types::{RunReport, StageContext, StageReport, WorkLayout};
use crate::commands::{convert, ExecContext, ToolPaths};
use crate::config::{OutputKind, Settings, MAX_FRAMES};
use crate::frames::{
    ExportReport, ExportRequest, FrameError, FrameSequenceStore, SpliceReport, SpliceRequest,
};
use crate::invalidation::{
    ConflictResolver, FixedResolver, SettingsCategory, Stage, StageInvalidationTracker,
    StageObservation, StagePlan,
};
use crate::logging::SessionLogger;
use crate::media::{probe_media, MediaError, MediaSource, VideoParams};
use crate::process::{CancelToken, ProcessExecutor, ProgressSink, ProgressUpdate};

/// Forwards progress to the front-end and the session log.
struct TeeSink<'a> {
    front: &'a dyn ProgressSink,
    log: &'a SessionLogger,
}

impl ProgressSink for TeeSink<'_> {
    fn on_progress(&self, update: &ProgressUpdate) {
        self.front.on_progress(update);
        self.log.on_progress(update);
    }

    fn on_finished(&self) {
        self.front.on_finished();
    }
}

/// Owns one work session: source, settings, stage directories and the
/// invalidation state between runs.
///
/// One operation at a time; every mutating call takes `&mut self`.
pub struct PipelineController {
    settings: Settings,
    source: MediaSource,
    params: Option<VideoParams>,
    layout: WorkLayout,
    tools: ToolPaths,
    executor: Arc<dyn ProcessExecutor>,
    logger: Arc<SessionLogger>,
    resolver: Box<dyn ConflictResolver + Send>,
    tracker: StageInvalidationTracker,
    last_output: Option<PathBuf>,
}

impl PipelineController {
    /// Create a controller and its work directories.
    pub fn new(
        settings: Settings,
        source: MediaSource,
        executor: Arc<dyn ProcessExecutor>,
        logger: Arc<SessionLogger>,
    ) -> PipelineResult<Self> {
        settings
            .validate()
            .map_err(PipelineError::ValidationFailed)?;

        let layout = WorkLayout::new(&settings.paths.work_dir);
        layout.ensure().map_err(|e| {
            PipelineError::setup_failed(format!(
                "Cannot create work directory {}: {}",
                layout.root().display(),
                e
            ))
        })?;

        Ok(Self {
            tools: ToolPaths::from_settings(&settings.paths),
            settings,
            source,
            params: None,
            layout,
            executor,
            logger,
            resolver: Box::new(FixedResolver::default()),
            tracker: StageInvalidationTracker::new(),
            last_output: None,
        })
    }

    /// Use `resolver` for conflict and large-output questions.
    pub fn with_resolver(mut self, resolver: Box<dyn ConflictResolver + Send>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Skip probing and use known source parameters.
    pub fn with_video_params(mut self, params: VideoParams) -> Self {
        self.params = Some(params);
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn source(&self) -> &MediaSource {
        &self.source
    }

    pub fn layout(&self) -> &WorkLayout {
        &self.layout
    }

    pub fn tracker(&self) -> &StageInvalidationTracker {
        &self.tracker
    }

    pub fn logger(&self) -> &SessionLogger {
        &self.logger
    }

    /// Output file of the last successful Generate run.
    pub fn last_output(&self) -> Option<&Path> {
        self.last_output.as_deref()
    }

    /// Frame store of a frame-producing stage.
    pub fn store(&self, stage: Stage) -> Option<FrameSequenceStore> {
        self.layout.store(stage)
    }

    /// Replace the settings, counting changed fields per category.
    pub fn update_settings(
        &mut self,
        settings: Settings,
    ) -> PipelineResult<BTreeMap<SettingsCategory, u32>> {
        settings
            .validate()
            .map_err(PipelineError::ValidationFailed)?;

        let changes = self.settings.category_changes(&settings);
        self.tracker.record_changes(&changes);
        for stage in Stage::ALL {
            if !self.tracker.counters().pending_for(stage).is_empty() {
                self.tracker.mark_dirty(stage);
            }
        }

        if settings.paths != self.settings.paths {
            self.tools = ToolPaths::from_settings(&settings.paths);
            if settings.paths.work_dir != self.settings.paths.work_dir {
                let layout = WorkLayout::new(&settings.paths.work_dir);
                layout.ensure().map_err(|e| {
                    PipelineError::setup_failed(format!(
                        "Cannot create work directory {}: {}",
                        layout.root().display(),
                        e
                    ))
                })?;
                self.layout = layout;
                self.tracker.reset();
            }
        }

        self.settings = settings;
        Ok(changes)
    }

    /// Switch to a new source. Everything runs again.
    pub fn set_source(&mut self, source: MediaSource) {
        self.logger
            .info(&format!("New source with {} input(s)", source.input_count()));
        self.source = source;
        self.params = None;
        self.last_output = None;
        self.tracker.reset();
    }

    /// Probe the source once and cache the result.
    pub fn video_params(&mut self, cancel: &CancelToken) -> PipelineResult<VideoParams> {
        if let Some(params) = &self.params {
            return Ok(params.clone());
        }

        let params = probe_media(self.executor.as_ref(), &self.tools.ffmpeg, &self.source, cancel)
            .map_err(|e| match e {
                MediaError::Cancelled => PipelineError::Cancelled { stage: None },
                other => PipelineError::stage_failed(Stage::Extracted, StageError::Media(other)),
            })?;

        self.logger.info(&format!(
            "Source is {}x{} at {:.2} fps{}",
            params.width,
            params.height,
            params.fps,
            params
                .length_str()
                .map(|l| format!(", length {}", l))
                .unwrap_or_default()
        ));
        self.params = Some(params.clone());
        Ok(params)
    }

    fn observe(&self, stage: Stage) -> StageObservation {
        match self.layout.store(stage) {
            Some(store) => StageObservation {
                on_disk: store.last_modified(),
                has_output: store.count().map(|n| n > 0).unwrap_or(false),
            },
            None => match self.last_output.as_ref().and_then(|p| fs::metadata(p).ok()) {
                Some(meta) => StageObservation {
                    on_disk: meta.modified().ok(),
                    has_output: meta.len() > 0,
                },
                None => StageObservation::default(),
            },
        }
    }

    /// What `process_up_to(target)` would run right now.
    pub fn plan(&self, target: Stage) -> StagePlan {
        self.tracker.plan(target, |stage| self.observe(stage))
    }

    fn check_frame_budget(&self, plan: &StagePlan) -> PipelineResult<()> {
        if !plan.stages_to_run().contains(&Stage::Extracted) {
            return Ok(());
        }

        let frames = if self.source.is_video() {
            self.settings.timing.expected_frames()
        } else {
            self.source.input_count() as u32
        };
        if frames > MAX_FRAMES {
            return Err(PipelineError::validation_failed(if self.source.is_video() {
                format!(
                    "{} frames exceed the limit of {}. Shorten the duration or lower the frame rate",
                    frames, MAX_FRAMES
                )
            } else {
                format!("{} images exceed the limit of {} frames", frames, MAX_FRAMES)
            }));
        }

        let threshold = self.settings.behavior.large_gif_frames;
        if threshold > 0
            && frames > threshold
            && !self.resolver.confirm_large_output(frames, threshold)
        {
            return Err(PipelineError::Declined(format!(
                "{} frames is above the {} frame threshold",
                frames, threshold
            )));
        }
        Ok(())
    }

    /// Bring `target` and everything before it up to date.
    ///
    /// A `preview` run leaves the settings change counters alone, so the
    /// next full run still treats those changes as pending.
    pub fn process_up_to(
        &mut self,
        target: Stage,
        preview: bool,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> PipelineResult<RunReport> {
        self.settings
            .validate()
            .map_err(PipelineError::ValidationFailed)?;

        let mut report = RunReport::new(target, preview);
        let mut plan = self.plan(target);

        if !plan.conflicts.is_empty() {
            report.conflicts = plan.conflicts.clone();
            if !self.resolver.confirm_discard_edits(&plan.conflicts) {
                self.tracker.keep_edits(&plan.conflicts);
                report.edits_kept = true;
                plan = self.plan(target);
            }
        }

        if plan.is_empty() {
            self.logger.info(&format!("{} is up to date", target));
            return Ok(report);
        }

        self.check_frame_budget(&plan)?;
        let params = self.video_params(cancel)?;

        self.logger
            .run_started(target, preview, &plan.stages_to_run());

        for (stage, reasons) in &plan.stages {
            let stage = *stage;
            if cancel.is_cancelled() {
                self.logger.warn(&format!("Cancelled before {}", stage));
                return Err(PipelineError::Cancelled { stage: Some(stage) });
            }

            self.logger.begin_stage(stage, reasons);
            self.tracker.mark_running(stage);

            match self.run_stage(stage, &params, sink, cancel) {
                Ok(mut stage_report) => {
                    if let Some(output) = &stage_report.output {
                        self.last_output = Some(output.clone());
                    }
                    let observed = self.observe(stage).on_disk;
                    self.tracker
                        .mark_succeeded(stage, SystemTime::now(), observed, !preview);
                    if let Some(log) = self.logger.finish_stage(stage_report.frames) {
                        stage_report.tools_run = log.tools_run;
                    }
                    report.stages.push(stage_report);
                }
                Err(e) => {
                    self.tracker.mark_failed(stage);
                    if let Some(store) = self.layout.store(stage) {
                        if let Err(clear_err) = store.clear() {
                            tracing::warn!("Could not clear {}: {}", store.dir().display(), clear_err);
                        }
                    }

                    if e.is_cancelled() || cancel.is_cancelled() {
                        self.logger.cancel_stage();
                        return Err(PipelineError::Cancelled { stage: Some(stage) });
                    }

                    self.logger.fail_stage(&e);
                    return Err(PipelineError::stage_failed(stage, e));
                }
            }
        }

        self.logger.flush();
        Ok(report)
    }

    fn run_stage(
        &self,
        stage: Stage,
        params: &VideoParams,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> StageResult<StageReport> {
        let tee = TeeSink {
            front: sink,
            log: &self.logger,
        };
        let ctx = StageContext {
            settings: &self.settings,
            source: &self.source,
            params,
            layout: &self.layout,
            exec: ExecContext::new(self.executor.as_ref(), &self.tools, &tee, cancel),
            logger: &self.logger,
        };

        let runner = runner_for(stage);
        self.logger
            .debug(&format!("Validating input for '{}'", runner.name()));
        runner.validate_input(&ctx)?;
        let report = runner.execute(&ctx)?;
        runner.validate_output(&ctx, &report)?;
        Ok(report)
    }

    /// Render extracted frame `index` (1-based) with the current size and
    /// effects into the preview file. Stage directories are not touched.
    pub fn preview_frame(
        &mut self,
        index: usize,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> PipelineResult<PathBuf> {
        let frames = self
            .layout
            .store(Stage::Extracted)
            .map(|s| s.enumerate())
            .transpose()
            .map_err(|e| PipelineError::stage_failed(Stage::Extracted, e.into()))?
            .unwrap_or_default();

        let frame = frames.get(index.wrapping_sub(1)).cloned().ok_or_else(|| {
            PipelineError::validation_failed(format!(
                "Frame {} does not exist ({} extracted)",
                index,
                frames.len()
            ))
        })?;

        let params = self.video_params(cancel)?;
        let preview_dir = self.layout.preview_dir();
        fs::create_dir_all(&preview_dir).map_err(|e| {
            PipelineError::stage_failed(
                Stage::Processed,
                StageError::io_error("creating preview folder", e),
            )
        })?;
        let resized = preview_dir.join("resized.png");
        let output = self.layout.preview_file();

        let tee = TeeSink {
            front: sink,
            log: &self.logger,
        };
        let ctx = StageContext {
            settings: &self.settings,
            source: &self.source,
            params: &params,
            layout: &self.layout,
            exec: ExecContext::new(self.executor.as_ref(), &self.tools, &tee, cancel),
            logger: &self.logger,
        };

        let render = || -> StageResult<()> {
            ctx.run(&convert::crop_resize(
                &self.tools,
                &frame,
                (params.width, params.height),
                &self.settings.size,
                0,
                &resized,
            )?)?;
            ctx.run(&convert::apply_effects(
                &self.tools,
                &resized,
                &self.settings.effects,
                index as u32,
                self.settings.output.kind() == Some(OutputKind::Gif),
                50,
                &output,
            )?)?;
            Ok(())
        };

        render().map_err(|e| {
            if e.is_cancelled() {
                PipelineError::Cancelled {
                    stage: Some(Stage::Processed),
                }
            } else {
                PipelineError::stage_failed(Stage::Processed, e)
            }
        })?;
        sink.on_finished();
        Ok(output)
    }

    fn extracted_store(&self) -> PipelineResult<FrameSequenceStore> {
        self.layout.store(Stage::Extracted).ok_or_else(|| {
            PipelineError::setup_failed("Extracted stage has no frame directory")
        })
    }

    fn edit_failed(e: FrameError) -> PipelineError {
        let e = StageError::from(e);
        if e.is_cancelled() {
            PipelineError::Cancelled {
                stage: Some(Stage::Extracted),
            }
        } else {
            PipelineError::stage_failed(Stage::Extracted, e)
        }
    }

    /// Extracted frames changed in place.
    fn frames_edited(&mut self) {
        let stale = self.tracker.frames_edited(Stage::Extracted);
        tracing::debug!("Extracted frames edited, stale: {:?}", stale);
    }

    /// Insert imported frames or blank frames into the extracted sequence.
    pub fn splice_frames(
        &mut self,
        request: &SpliceRequest,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> PipelineResult<SpliceReport> {
        let store = self.extracted_store()?;
        let ctx = ExecContext::new(self.executor.as_ref(), &self.tools, sink, cancel);
        let result = store.splice(request, &ctx);
        self.frames_edited();
        let report = result.map_err(Self::edit_failed)?;
        self.logger.info(&format!(
            "Inserted {} frame(s), {} total",
            report.inserted, report.total
        ));
        Ok(report)
    }

    /// Cross-fade extracted frames `start..=end`.
    pub fn cross_fade(
        &mut self,
        start: usize,
        end: usize,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> PipelineResult<usize> {
        let store = self.extracted_store()?;
        let ctx = ExecContext::new(self.executor.as_ref(), &self.tools, sink, cancel);
        let result = store.cross_fade(start, end, &ctx);
        self.frames_edited();
        result.map_err(Self::edit_failed)
    }

    /// Reverse the extracted frames.
    pub fn reverse_frames(&mut self) -> PipelineResult<usize> {
        let count = self.extracted_store()?.reverse().map_err(Self::edit_failed)?;
        self.frames_edited();
        Ok(count)
    }

    /// Delete extracted frames `start..=end`.
    pub fn delete_frames(&mut self, start: usize, end: usize) -> PipelineResult<usize> {
        let removed = self
            .extracted_store()?
            .delete_range(start, end)
            .map_err(Self::edit_failed)?;
        self.frames_edited();
        Ok(removed)
    }

    /// Remove duplicate extracted frames.
    pub fn cull_duplicates(&mut self) -> PipelineResult<usize> {
        let store = self.extracted_store()?;
        let report = store.detect_duplicates(false).map_err(Self::edit_failed)?;
        let removed = store.cull_duplicates(&report).map_err(Self::edit_failed)?;
        if removed > 0 {
            self.frames_edited();
        }
        Ok(removed)
    }

    /// Copy frames of `from` out of the work directory.
    pub fn export_frames(
        &self,
        from: Stage,
        request: &ExportRequest,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> PipelineResult<ExportReport> {
        let store = self.layout.store(from).ok_or_else(|| {
            PipelineError::validation_failed(format!("{} does not produce frames", from))
        })?;
        let ctx = ExecContext::new(self.executor.as_ref(), &self.tools, sink, cancel);
        let report = store.export(request, &ctx).map_err(|e| {
            let e = StageError::from(e);
            if e.is_cancelled() {
                PipelineError::Cancelled { stage: Some(from) }
            } else {
                PipelineError::stage_failed(from, e)
            }
        })?;
        self.logger.info(&format!(
            "Exported {} {} frame(s) to {}",
            report.exported.len(),
            from,
            request.dest.display()
        ));
        for (frame, reason) in &report.failed {
            self.logger
                .warn(&format!("Not exported {}: {}", frame.display(), reason));
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::ImportItem;
    use crate::invalidation::{EditConflict, StageState};
    use crate::logging::LogConfig;
    use crate::process::testing::RecordingExecutor;
    use crate::process::NullSink;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    struct Session {
        dir: TempDir,
        exec: Arc<RecordingExecutor>,
        controller: PipelineController,
    }

    fn params() -> VideoParams {
        VideoParams {
            width: 320,
            height: 240,
            duration_ms: Some(60_000),
            fps: 30.0,
        }
    }

    fn base_settings(dir: &Path) -> Settings {
        let mut settings = Settings::default();
        settings.paths.work_dir = dir.join("work").display().to_string();
        settings.output.path = dir.join("out").join("anim.gif").display().to_string();
        settings
    }

    fn session_with(exec: RecordingExecutor, configure: impl FnOnce(&mut Settings)) -> Session {
        crate::logging::init_test_tracing();
        let dir = tempdir().unwrap();
        let video = dir.path().join("clip.mp4");
        fs::write(&video, "video").unwrap();

        let mut settings = base_settings(dir.path());
        configure(&mut settings);

        let exec = Arc::new(exec);
        let logger = Arc::new(
            SessionLogger::new("test", dir.path().join("logs"), LogConfig::default(), None)
                .unwrap(),
        );
        let controller =
            PipelineController::new(settings, MediaSource::Video(video), exec.clone(), logger)
                .unwrap()
                .with_video_params(params());

        Session {
            dir,
            exec,
            controller,
        }
    }

    fn session() -> Session {
        session_with(RecordingExecutor::new(), |_| {})
    }

    fn run(session: &mut Session, target: Stage) -> PipelineResult<RunReport> {
        session
            .controller
            .process_up_to(target, false, &NullSink, &CancelToken::new())
    }

    fn convert_calls_with_marker(exec: &RecordingExecutor, label: &str) -> usize {
        exec.calls()
            .iter()
            .filter(|c| c.args.iter().any(|a| a.starts_with(&format!("{}:", label))))
            .count()
    }

    struct CountingResolver {
        asked: Arc<AtomicUsize>,
        discard: bool,
    }

    impl ConflictResolver for CountingResolver {
        fn confirm_discard_edits(&self, conflicts: &[EditConflict]) -> bool {
            assert!(!conflicts.is_empty());
            self.asked.fetch_add(1, Ordering::SeqCst);
            self.discard
        }
    }

    /// Full run, then hand-edit a resized frame and change the crop size.
    fn edited_resize_session(discard: bool) -> (Session, Arc<AtomicUsize>) {
        let mut s = session();
        let asked = Arc::new(AtomicUsize::new(0));
        let resolver = CountingResolver {
            asked: asked.clone(),
            discard,
        };
        s.controller = s.controller.with_resolver(Box::new(resolver));
        run(&mut s, Stage::Generated).unwrap();

        thread::sleep(Duration::from_millis(50));
        let resized = s.controller.store(Stage::Resized).unwrap();
        fs::write(resized.frame_path(1), "edited by hand").unwrap();

        let mut settings = s.controller.settings().clone();
        settings.size.output_width = 200;
        s.controller.update_settings(settings).unwrap();
        s.exec.clear();
        (s, asked)
    }

    #[test]
    fn full_run_writes_every_stage() {
        let mut s = session();
        let report = run(&mut s, Stage::Generated).unwrap();

        assert_eq!(report.stages_run(), Stage::ALL.to_vec());
        // 1 extract + 5 resize + 5 effects + 1 assemble
        assert_eq!(s.exec.call_count(), 12);
        assert_eq!(s.controller.store(Stage::Processed).unwrap().count().unwrap(), 5);

        let output = report.output().unwrap();
        assert!(output.exists());
        assert_eq!(s.controller.last_output(), Some(output));
    }

    #[test]
    fn second_run_without_changes_does_nothing() {
        let mut s = session();
        run(&mut s, Stage::Generated).unwrap();
        s.exec.clear();

        let report = run(&mut s, Stage::Generated).unwrap();
        assert!(report.was_noop());
        assert_eq!(s.exec.call_count(), 0);
    }

    #[test]
    fn effects_change_reruns_only_effects_and_generate() {
        let mut s = session();
        run(&mut s, Stage::Generated).unwrap();
        s.exec.clear();

        let mut settings = s.controller.settings().clone();
        settings.effects.brightness = 20;
        let changes = s.controller.update_settings(settings).unwrap();
        assert_eq!(changes.get(&SettingsCategory::ColorEffects), Some(&1));

        let report = run(&mut s, Stage::Generated).unwrap();
        assert_eq!(report.stages_run(), vec![Stage::Processed, Stage::Generated]);
        assert_eq!(s.exec.call_count(), 6);
        assert!(s.exec.calls().iter().all(|c| !c.program.contains("ffmpeg")));
        assert_eq!(convert_calls_with_marker(&s.exec, "Crop and Resize"), 0);
    }

    #[test]
    fn target_stops_early() {
        let mut s = session();
        let report = run(&mut s, Stage::Resized).unwrap();
        assert_eq!(report.stages_run(), vec![Stage::Extracted, Stage::Resized]);
        assert!(s.controller.last_output().is_none());
    }

    #[test]
    fn cancellation_leaves_no_partial_frames() {
        // Call 1 extracts, calls 2.. resize; cancel on the second resize.
        let mut s = session_with(RecordingExecutor::new().cancelling_on_call(3), |_| {});
        let err = run(&mut s, Stage::Generated).unwrap_err();

        assert!(matches!(
            err,
            PipelineError::Cancelled {
                stage: Some(Stage::Resized)
            }
        ));
        assert_eq!(s.exec.call_count(), 3);
        assert_eq!(s.controller.store(Stage::Resized).unwrap().count().unwrap(), 0);
        assert_eq!(
            s.controller.tracker().state(Stage::Resized),
            crate::invalidation::StageState::Failed
        );
        // Extracted frames survive and are not redone.
        assert_eq!(s.controller.store(Stage::Extracted).unwrap().count().unwrap(), 5);
        assert_eq!(
            s.controller.plan(Stage::Generated).stages_to_run(),
            vec![Stage::Resized, Stage::Processed, Stage::Generated]
        );
    }

    #[test]
    fn tool_failure_clears_stage_and_reports() {
        let exec = RecordingExecutor::new()
            .failing_when(|inv| inv.label() == "Applying Filters, Effects and Captions");
        let mut s = session_with(exec, |_| {});
        let err = run(&mut s, Stage::Generated).unwrap_err();

        match &err {
            PipelineError::StageFailed { stage, source } => {
                assert_eq!(*stage, Stage::Processed);
                assert!(matches!(source, StageError::ToolFailed { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.user_message().contains("applying effects"));
        assert_eq!(s.controller.store(Stage::Processed).unwrap().count().unwrap(), 0);
    }

    #[test]
    fn keeping_edits_skips_resize() {
        let (mut s, asked) = edited_resize_session(false);
        let report = run(&mut s, Stage::Generated).unwrap();

        assert_eq!(asked.load(Ordering::SeqCst), 1);
        assert!(report.edits_kept);
        assert_eq!(report.conflicts[0].stage, Stage::Resized);
        assert_eq!(report.stages_run(), vec![Stage::Processed, Stage::Generated]);
        assert_eq!(convert_calls_with_marker(&s.exec, "Crop and Resize"), 0);

        let resized = s.controller.store(Stage::Resized).unwrap();
        assert_eq!(
            fs::read_to_string(resized.frame_path(1)).unwrap(),
            "edited by hand"
        );
    }

    #[test]
    fn discarding_edits_reruns_resize() {
        let (mut s, asked) = edited_resize_session(true);
        let report = run(&mut s, Stage::Generated).unwrap();

        assert_eq!(asked.load(Ordering::SeqCst), 1);
        assert!(!report.edits_kept);
        assert_eq!(
            report.stages_run(),
            vec![Stage::Resized, Stage::Processed, Stage::Generated]
        );
        assert_eq!(convert_calls_with_marker(&s.exec, "Crop and Resize"), 5);
    }

    #[test]
    fn preview_run_keeps_changes_pending() {
        let mut s = session();
        run(&mut s, Stage::Generated).unwrap();

        let mut settings = s.controller.settings().clone();
        settings.effects.sepia = true;
        s.controller.update_settings(settings).unwrap();

        let preview = s
            .controller
            .process_up_to(Stage::Processed, true, &NullSink, &CancelToken::new())
            .unwrap();
        assert_eq!(preview.stages_run(), vec![Stage::Processed]);
        assert_eq!(
            s.controller
                .tracker()
                .counters()
                .get(SettingsCategory::ColorEffects),
            1
        );

        let full = run(&mut s, Stage::Generated).unwrap();
        assert_eq!(full.stages_run(), vec![Stage::Processed, Stage::Generated]);
        assert!(s.controller.tracker().counters().is_clean());
    }

    #[test]
    fn start_past_end_explains_missing_frames() {
        let exec = RecordingExecutor::new().with_pattern_frames(0);
        let mut s = session_with(exec, |settings| {
            settings.timing.start_time = "00:02:00.000".to_string();
        });
        let err = run(&mut s, Stage::Generated).unwrap_err();

        match err {
            PipelineError::StageFailed {
                stage: Stage::Extracted,
                source: StageError::NoFrames(message),
            } => assert_eq!(message, "Start time specified is greater than 00:01:00.000."),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unknown_length_gets_generic_message() {
        let exec = RecordingExecutor::new().with_pattern_frames(0);
        let mut s = session_with(exec, |_| {});
        s.controller = s.controller.with_video_params(VideoParams {
            duration_ms: None,
            ..params()
        });
        let err = run(&mut s, Stage::Extracted).unwrap_err();
        assert!(err.to_string().contains("which is unknown"));
    }

    #[test]
    fn slowdown_fix_drops_lead_frames() {
        let exec = RecordingExecutor::new().with_pattern_frames(25);
        let mut s = session_with(exec, |settings| {
            settings.timing.start_time = "00:00:10.000".to_string();
            settings.timing.fix_slowdown_glitch = true;
        });
        let report = run(&mut s, Stage::Extracted).unwrap();

        let extract = &s.exec.calls()[0];
        assert!(extract.has_arg("00:00:08.000"));
        assert!(extract.has_arg("7.0"));
        // 2 s at 10 fps dropped
        assert_eq!(report.stages[0].frames, 5);
    }

    #[test]
    fn declined_large_output_runs_nothing() {
        let mut s = session_with(RecordingExecutor::new(), |settings| {
            settings.timing.duration_sec = 60.0;
        });
        s.controller = s.controller.with_resolver(Box::new(FixedResolver {
            discard_edits: true,
            allow_large_output: false,
        }));

        let err = run(&mut s, Stage::Generated).unwrap_err();
        assert!(matches!(err, PipelineError::Declined(_)));
        assert_eq!(s.exec.call_count(), 0);
    }

    #[test]
    fn too_many_frames_is_rejected() {
        let mut s = session_with(RecordingExecutor::new(), |settings| {
            settings.timing.duration_sec = 1000.0;
        });
        let err = run(&mut s, Stage::Generated).unwrap_err();
        assert!(matches!(err, PipelineError::ValidationFailed(_)));
    }

    #[test]
    fn image_sequence_skips_missing_inputs() {
        let mut s = session();
        let a = s.dir.path().join("a.png");
        let c = s.dir.path().join("c.png");
        fs::write(&a, "a").unwrap();
        fs::write(&c, "c").unwrap();
        let missing = s.dir.path().join("missing.png");

        s.controller
            .set_source(MediaSource::ImageSequence(vec![a, missing, c]));
        s.controller = s.controller.with_video_params(params());

        let report = run(&mut s, Stage::Extracted).unwrap();
        assert_eq!(report.stages[0].frames, 2);
        assert_eq!(report.stages[0].skipped_items, 1);
        assert_eq!(s.exec.call_count(), 2);
    }

    #[test]
    fn preview_frame_leaves_stage_dirs_alone() {
        let mut s = session();
        run(&mut s, Stage::Extracted).unwrap();
        s.exec.clear();

        let path = s
            .controller
            .preview_frame(2, &NullSink, &CancelToken::new())
            .unwrap();
        assert_eq!(path, s.controller.layout().preview_file());
        assert!(path.exists());
        assert_eq!(s.exec.call_count(), 2);
        assert_eq!(s.controller.store(Stage::Resized).unwrap().count().unwrap(), 0);

        assert!(s
            .controller
            .preview_frame(9, &NullSink, &CancelToken::new())
            .is_err());
    }

    #[test]
    fn frame_edits_dirty_downstream_stages() {
        let mut s = session();
        run(&mut s, Stage::Generated).unwrap();

        thread::sleep(Duration::from_millis(50));
        assert_eq!(s.controller.delete_frames(1, 2).unwrap(), 2);
        let request = SpliceRequest::new(vec![ImportItem::Color("black".to_string())], 0, (320, 240));
        let spliced = s
            .controller
            .splice_frames(&request, &NullSink, &CancelToken::new())
            .unwrap();
        assert_eq!(spliced.total, 4);
        for stage in [Stage::Resized, Stage::Processed, Stage::Generated] {
            assert_eq!(s.controller.tracker().state(stage), StageState::Dirty);
        }
        assert_eq!(
            s.controller.tracker().state(Stage::Extracted),
            StageState::Clean
        );

        s.exec.clear();
        let report = run(&mut s, Stage::Generated).unwrap();
        assert_eq!(
            report.stages_run(),
            vec![Stage::Resized, Stage::Processed, Stage::Generated]
        );
        assert_eq!(convert_calls_with_marker(&s.exec, "Crop and Resize"), 4);
        assert_eq!(
            s.controller.tracker().state(Stage::Resized),
            StageState::Clean
        );
    }

    #[test]
    fn numbered_output_when_not_overwriting() {
        let mut s = session_with(RecordingExecutor::new(), |settings| {
            settings.output.overwrite = false;
        });
        let report = run(&mut s, Stage::Generated).unwrap();
        let first = report.output().unwrap().to_path_buf();
        assert!(first.ends_with("anim001.gif"));

        let mut settings = s.controller.settings().clone();
        settings.output.loops = 3;
        s.controller.update_settings(settings).unwrap();
        let report = run(&mut s, Stage::Generated).unwrap();
        assert!(report.output().unwrap().ends_with("anim002.gif"));
    }

    #[test]
    fn toggling_auto_cull_reruns_every_stage() {
        let mut s = session();
        run(&mut s, Stage::Generated).unwrap();
        s.exec.clear();

        let mut settings = s.controller.settings().clone();
        settings.behavior.auto_cull_duplicates = !settings.behavior.auto_cull_duplicates;
        let changes = s.controller.update_settings(settings).unwrap();
        assert_eq!(changes.get(&SettingsCategory::TimeRate), Some(&1));

        let report = run(&mut s, Stage::Generated).unwrap();
        assert_eq!(report.stages_run(), Stage::ALL.to_vec());
        assert!(s.exec.call_count() > 0);
    }

    #[test]
    fn session_log_has_a_block_per_stage() {
        let mut s = session();
        let report = run(&mut s, Stage::Generated).unwrap();
        assert_eq!(report.stages[0].tools_run, 1);
        assert_eq!(report.stages[1].tools_run, 5);
        s.controller.logger().flush();

        let log = fs::read_to_string(s.controller.logger().log_path()).unwrap();
        assert!(log.contains("Run to Generate: Extract > Crop and Resize > Effects > Generate"));
        assert!(log.contains("[Crop and Resize] << 5 frame(s), 5 tool run(s)"));
        assert!(log.contains("[Generate] << "));
    }

    #[test]
    fn large_image_sequence_needs_confirmation() {
        let mut s = session_with(RecordingExecutor::new(), |settings| {
            settings.behavior.large_gif_frames = 2;
        });
        let images: Vec<PathBuf> = (0..3)
            .map(|i| {
                let path = s.dir.path().join(format!("img{}.png", i));
                fs::write(&path, "img").unwrap();
                path
            })
            .collect();
        s.controller.set_source(MediaSource::ImageSequence(images));
        s.controller = s.controller.with_resolver(Box::new(FixedResolver {
            discard_edits: true,
            allow_large_output: false,
        }));

        let err = run(&mut s, Stage::Generated).unwrap_err();
        assert!(matches!(err, PipelineError::Declined(_)));
        assert_eq!(s.exec.call_count(), 0);
    }

    #[test]
    fn export_from_resized_rotates_copies() {
        let mut s = session();
        run(&mut s, Stage::Resized).unwrap();
        s.exec.clear();

        let dest = s.dir.path().join("export");
        let mut request = ExportRequest::new(2, 4, &dest);
        request.rotate_degrees = 180;
        let report = s
            .controller
            .export_frames(Stage::Resized, &request, &NullSink, &CancelToken::new())
            .unwrap();

        assert_eq!(report.exported.len(), 3);
        assert!(dest.join("frame0003.png").exists());
        assert_eq!(s.exec.call_count(), 3);
        assert!(s.exec.calls().iter().all(|c| c.has_arg("180")));
    }

    #[test]
    fn export_from_generated_is_rejected() {
        let mut s = session();
        run(&mut s, Stage::Generated).unwrap();
        let request = ExportRequest::new(1, 1, s.dir.path().join("export"));
        let err = s
            .controller
            .export_frames(Stage::Generated, &request, &NullSink, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, PipelineError::ValidationFailed(_)));
    }

    #[test]
    fn random_start_seeks_inside_the_video() {
        let mut s = session_with(RecordingExecutor::new(), |settings| {
            settings.timing.start_time = "random".to_string();
        });
        run(&mut s, Stage::Extracted).unwrap();

        let extract = &s.exec.calls()[0];
        let ss = extract.args.iter().position(|a| a == "-ss").unwrap();
        let start = crate::media::parse_duration_ms(&extract.args[ss + 1]).unwrap();
        assert!(start < 60_000);
    }

    #[test]
    fn random_start_needs_a_known_length() {
        let mut s = session_with(RecordingExecutor::new(), |settings| {
            settings.timing.start_time = "random".to_string();
        });
        s.controller = s.controller.with_video_params(VideoParams {
            duration_ms: None,
            ..params()
        });
        let err = run(&mut s, Stage::Extracted).unwrap_err();
        assert!(matches!(err, PipelineError::StageFailed { .. }));
        assert_eq!(s.exec.call_count(), 0);
    }

    #[test]
    fn failed_retime_removes_the_gif() {
        let exec = RecordingExecutor::new().failing_when(|inv| inv.label() == "Frame timing");
        let mut s = session_with(exec, |settings| {
            settings.output.custom_frame_timing = "0:500".to_string();
        });

        let err = run(&mut s, Stage::Generated).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::StageFailed {
                stage: Stage::Generated,
                ..
            }
        ));
        assert!(!s.dir.path().join("out").join("anim.gif").exists());
        assert!(s.controller.last_output().is_none());
    }

    #[test]
    fn cancelled_generate_removes_the_gif() {
        // 1 extract + 5 resize + 5 effects + assemble, then retime
        let exec = RecordingExecutor::new().cancelling_on_call(13);
        let mut s = session_with(exec, |settings| {
            settings.output.custom_frame_timing = "0:500".to_string();
        });

        let err = run(&mut s, Stage::Generated).unwrap_err();
        assert!(err.is_cancelled());
        assert!(!s.dir.path().join("out").join("anim.gif").exists());
    }
}
