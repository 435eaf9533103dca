//! Extract stage: source media to numbered frames in `original/`.

use std::fs;
use std::path::{Path, PathBuf};

use crate::commands::{convert, ffmpeg, step_percent};
use crate::frames::FrameSequenceStore;
use crate::invalidation::Stage;
use crate::media::{format_duration_ms, MediaSource};
use crate::pipeline::errors::{StageError, StageResult};
use crate::pipeline::stage::StageRunner;
use crate::pipeline::types::{StageContext, StageReport};

/// Seconds extraction starts early when dodging the slowdown glitch.
const GLITCH_LEAD_SECS: u64 = 2;

/// Image sequences longer than this fail if every frame is the same.
const IDENTICAL_SEQUENCE_LIMIT: usize = 20;

/// Extract step.
pub struct ExtractStage;

impl ExtractStage {
    fn extract_video(
        &self,
        ctx: &StageContext,
        store: &FrameSequenceStore,
        video: &Path,
    ) -> StageResult<()> {
        let timing = &ctx.settings.timing;
        let mut start_ms = timing
            .resolve_start_ms(ctx.params.duration_ms, &mut rand::rng())
            .map_err(StageError::invalid_input)?;
        let requested_ms = start_ms;
        if timing.is_random_start() {
            ctx.logger.info(&format!(
                "Random start time {}",
                format_duration_ms(start_ms)
            ));
        }
        let mut duration = timing.duration_sec;
        let lead_ms = GLITCH_LEAD_SECS * 1000;

        let deglitch = timing.fix_slowdown_glitch && start_ms > lead_ms;
        if deglitch {
            ctx.logger
                .info("Starting two seconds early to avoid the slowdown glitch");
            start_ms -= lead_ms;
            duration += GLITCH_LEAD_SECS as f64;
        }

        let invocation = ffmpeg::extract_frames(
            ctx.exec.tools,
            video,
            &format_duration_ms(start_ms),
            duration,
            timing.frame_rate,
            &store.pattern(),
        )?;
        let outcome = ctx.run_lenient(&invocation)?;
        if !outcome.success {
            ctx.logger.warn(&format!(
                "ffmpeg exited with code {:?}, discarding extracted frames",
                outcome.exit_code
            ));
            store.clear()?;
        }

        self.check_first_frame(ctx, store, requested_ms)?;

        if deglitch {
            let lead_frames = GLITCH_LEAD_SECS as usize * timing.frame_rate as usize;
            for index in 1..=lead_frames {
                let frame = store.frame_path(index);
                fs::remove_file(&frame).map_err(|_| {
                    StageError::invalid_output(format!(
                        "De-glitch failed. Frame not found: {}",
                        frame.display()
                    ))
                })?;
            }
            store.re_enumerate()?;
        }

        Ok(())
    }

    /// Convert each input image. A failed image is logged and skipped.
    fn extract_sequence(
        &self,
        ctx: &StageContext,
        store: &FrameSequenceStore,
        images: &[PathBuf],
    ) -> StageResult<usize> {
        let (width, height) = (ctx.params.width, ctx.params.height);
        let mut written = 0;
        let mut skipped = 0;

        for (i, image) in images.iter().enumerate() {
            ctx.check_cancelled()?;

            if !image.exists() {
                tracing::warn!("Skipping missing image {}", image.display());
                ctx.logger
                    .warn(&format!("Image not found: {}", image.display()));
                skipped += 1;
                continue;
            }

            let output = store.frame_path(written + 1);
            let invocation = convert::sequence_frame(
                ctx.exec.tools,
                image,
                width,
                height,
                step_percent(i + 1, images.len()),
                &output,
            )?;
            let outcome = ctx.run_lenient(&invocation)?;

            if outcome.success && output.exists() {
                written += 1;
            } else {
                tracing::warn!("Failed to import {}", image.display());
                ctx.logger
                    .warn(&format!("Failed to import image: {}", image.display()));
                skipped += 1;
            }
        }

        ctx.exec.sink.on_finished();
        Ok(skipped)
    }

    fn check_first_frame(
        &self,
        ctx: &StageContext,
        store: &FrameSequenceStore,
        start_ms: u64,
    ) -> StageResult<()> {
        if store.frame_path(1).exists() {
            return Ok(());
        }

        let message = match (ctx.source, ctx.params.duration_ms) {
            (MediaSource::Video(_), Some(length_ms)) => {
                if start_ms > length_ms {
                    format!(
                        "Start time specified is greater than {}.",
                        format_duration_ms(length_ms)
                    )
                } else {
                    "Unsupported file type or DRM-protected.".to_string()
                }
            }
            (MediaSource::Video(_), None) => "Unable to extract images. Your start time might be \
                greater than the video's length, which is unknown."
                .to_string(),
            (MediaSource::ImageSequence(_), _) => {
                "None of the images could be imported.".to_string()
            }
        };
        Err(StageError::NoFrames(message))
    }
}

impl StageRunner for ExtractStage {
    fn stage(&self) -> Stage {
        Stage::Extracted
    }

    fn validate_input(&self, ctx: &StageContext) -> StageResult<()> {
        match ctx.source {
            MediaSource::Video(path) if !path.exists() => Err(StageError::invalid_input(format!(
                "'{}' does not exist!",
                path.display()
            ))),
            MediaSource::ImageSequence(images) if images.is_empty() => {
                Err(StageError::invalid_input("Image sequence is empty"))
            }
            _ => Ok(()),
        }
    }

    fn execute(&self, ctx: &StageContext) -> StageResult<StageReport> {
        let store = ctx.store(Stage::Extracted)?;
        store.ensure_dir()?;
        store.clear()?;

        let mut report = StageReport::new(Stage::Extracted);

        match ctx.source {
            MediaSource::Video(video) => self.extract_video(ctx, &store, video)?,
            MediaSource::ImageSequence(images) => {
                report.skipped_items = self.extract_sequence(ctx, &store, images)?;
                self.check_first_frame(ctx, &store, 0)?;
            }
        }

        let duplicates = store.detect_duplicates(false)?;
        let total = store.count()?;

        if !ctx.source.is_video()
            && total > IDENTICAL_SEQUENCE_LIMIT
            && duplicates.all_identical(total)
        {
            return Err(StageError::invalid_output(format!(
                "All {} frames are identical",
                total
            )));
        }

        if ctx.settings.behavior.auto_cull_duplicates {
            report.duplicates_removed = store.cull_duplicates(&duplicates)?;
            if report.duplicates_removed > 0 {
                ctx.logger.info(&format!(
                    "Removed {} duplicate frame(s)",
                    report.duplicates_removed
                ));
            }
        } else if !duplicates.is_empty() {
            ctx.logger.info(&format!(
                "{} duplicate frame(s) found",
                duplicates.duplicates.len()
            ));
        }

        report.frames = store.count()?;
        Ok(report)
    }

    fn validate_output(&self, _ctx: &StageContext, report: &StageReport) -> StageResult<()> {
        if report.frames == 0 {
            return Err(StageError::invalid_output("No frames extracted"));
        }
        Ok(())
    }
}
