//! Generate stage: `processed/` to the output GIF or video.

use std::fs;
use std::path::{Path, PathBuf};

use crate::commands::ffmpeg::AudioTrack;
use crate::commands::{convert, ffmpeg, gifsicle};
use crate::config::OutputKind;
use crate::invalidation::Stage;
use crate::pipeline::errors::{StageError, StageResult};
use crate::pipeline::stage::StageRunner;
use crate::pipeline::timing;
use crate::pipeline::types::{StageContext, StageReport};
use crate::process::ProcessError;

pub struct GenerateStage;

impl GenerateStage {
    fn output_kind(ctx: &StageContext) -> StageResult<OutputKind> {
        ctx.settings.output.kind().ok_or_else(|| {
            StageError::invalid_input(format!(
                "Unsupported output type: {}",
                ctx.settings.output.path
            ))
        })
    }

    fn audio_track(ctx: &StageContext) -> StageResult<Option<AudioTrack>> {
        let output = &ctx.settings.output;
        if !output.audio_enabled {
            return Ok(None);
        }
        let path = PathBuf::from(&output.audio_path);
        if !path.is_file() {
            return Err(StageError::invalid_input(format!(
                "Audio file not found: {}",
                path.display()
            )));
        }
        Ok(Some(AudioTrack {
            path,
            start: output.audio_start.clone(),
            volume: output.audio_volume,
        }))
    }

    fn generate_gif(&self, ctx: &StageContext, frames: usize, path: &Path) -> StageResult<()> {
        let output = &ctx.settings.output;
        let delay =
            timing::gif_frame_delay(ctx.settings.timing.frame_rate, output.speed_modifier);
        ctx.logger.info(&format!(
            "GIF delay {} cs, runtime {:.2}s",
            timing::gif_delay_centiseconds(delay),
            timing::total_runtime_secs(delay, frames)
        ));

        let processed = ctx.store(Stage::Processed)?;
        let invocation = convert::assemble_gif(
            ctx.exec.tools,
            &processed.glob(),
            timing::gif_delay_centiseconds(delay),
            output.loops,
            path,
        )?;
        ctx.run(&invocation)?;
        Self::check_output(path, OutputKind::Gif)?;

        let timings = output.frame_timings().map_err(StageError::InvalidInput)?;
        if !timings.is_empty() {
            ctx.logger
                .info(&format!("Applying {} custom frame timing(s)", timings.len()));
            ctx.run(&convert::retime_gif(ctx.exec.tools, path, &timings)?)?;
        }

        if output.optimize {
            self.optimize(ctx, path)?;
        }
        Ok(())
    }

    fn optimize(&self, ctx: &StageContext, path: &Path) -> StageResult<()> {
        let before = file_size(path);
        match ctx.run_lenient(&gifsicle::optimize(ctx.exec.tools, path)?) {
            Ok(outcome) if outcome.success => {
                let after = file_size(path);
                ctx.logger.info(&format!(
                    "Optimized GIF from {} to {} bytes",
                    before, after
                ));
                Ok(())
            }
            Ok(outcome) => {
                ctx.logger.warn(&format!(
                    "gifsicle failed with code {:?}, keeping unoptimized GIF",
                    outcome.exit_code
                ));
                Ok(())
            }
            Err(StageError::Process(ProcessError::ToolNotFound { program })) => {
                ctx.logger.warn(&format!(
                    "{} not found, skipping optimization",
                    program.display()
                ));
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn generate_video(
        &self,
        ctx: &StageContext,
        kind: OutputKind,
        path: &Path,
    ) -> StageResult<()> {
        let audio = Self::audio_track(ctx)?;
        let delay = timing::gif_frame_delay(
            ctx.settings.timing.frame_rate,
            ctx.settings.output.speed_modifier,
        );

        let processed = ctx.store(Stage::Processed)?;
        processed.re_enumerate()?;

        let invocation = ffmpeg::encode_video(
            ctx.exec.tools,
            &processed.pattern(),
            timing::video_input_fps(delay),
            kind,
            audio.as_ref(),
            path,
        )?;
        ctx.run(&invocation)?;
        Self::check_output(path, kind)
    }

    fn check_output(path: &Path, kind: OutputKind) -> StageResult<()> {
        if file_size(path) == 0 {
            let _ = fs::remove_file(path);
            return Err(StageError::invalid_output(format!(
                "Failed to create {}",
                kind.extension()
            )));
        }
        Ok(())
    }
}

fn file_size(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

impl StageRunner for GenerateStage {
    fn stage(&self) -> Stage {
        Stage::Generated
    }

    fn validate_input(&self, ctx: &StageContext) -> StageResult<()> {
        Self::output_kind(ctx)?;
        if ctx.store(Stage::Processed)?.is_empty()? {
            return Err(StageError::invalid_input("No processed frames to assemble"));
        }
        Ok(())
    }

    fn execute(&self, ctx: &StageContext) -> StageResult<StageReport> {
        let kind = Self::output_kind(ctx)?;
        let output = &ctx.settings.output;
        let path = timing::next_output_path(Path::new(&output.path), kind, output.overwrite);

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| StageError::io_error("creating output folder", e))?;
        }

        let frames = ctx.store(Stage::Processed)?.count()?;
        ctx.logger.info(&format!(
            "Writing {} frame(s) to {}",
            frames,
            path.display()
        ));

        let written = match kind {
            OutputKind::Gif => self.generate_gif(ctx, frames, &path),
            OutputKind::Mp4 | OutputKind::WebM => self.generate_video(ctx, kind, &path),
        };
        ctx.exec.sink.on_finished();
        if let Err(e) = written {
            // A half-written output is never left behind
            if path.exists() {
                if let Err(rm) = fs::remove_file(&path) {
                    tracing::warn!("Could not remove {}: {}", path.display(), rm);
                }
            }
            return Err(e);
        }

        let mut report = StageReport::new(Stage::Generated);
        report.frames = frames;
        report.output = Some(path);
        Ok(report)
    }

    fn validate_output(&self, _ctx: &StageContext, report: &StageReport) -> StageResult<()> {
        match &report.output {
            Some(path) if file_size(path) > 0 => Ok(()),
            Some(path) => Err(StageError::invalid_output(format!(
                "Output missing: {}",
                path.display()
            ))),
            None => Err(StageError::invalid_output("No output written")),
        }
    }
}
