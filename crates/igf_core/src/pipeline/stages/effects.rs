//! Effects stage: `resized/` to `processed/`.

use crate::commands::{convert, step_percent};
use crate::config::OutputKind;
use crate::invalidation::Stage;
use crate::pipeline::errors::{StageError, StageResult};
use crate::pipeline::stage::StageRunner;
use crate::pipeline::types::{StageContext, StageReport};

pub struct EffectsStage;

impl StageRunner for EffectsStage {
    fn stage(&self) -> Stage {
        Stage::Processed
    }

    fn validate_input(&self, ctx: &StageContext) -> StageResult<()> {
        if ctx.store(Stage::Resized)?.is_empty()? {
            return Err(StageError::invalid_input("No resized frames to process"));
        }
        Ok(())
    }

    fn execute(&self, ctx: &StageContext) -> StageResult<StageReport> {
        let frames = ctx.store(Stage::Resized)?.enumerate()?;
        let output = ctx.store(Stage::Processed)?;
        output.ensure_dir()?;
        output.clear()?;

        let palette = ctx.settings.output.kind() == Some(OutputKind::Gif);

        for (i, frame) in frames.iter().enumerate() {
            ctx.check_cancelled()?;
            let invocation = convert::apply_effects(
                ctx.exec.tools,
                frame,
                &ctx.settings.effects,
                (i + 1) as u32,
                palette,
                step_percent(i + 1, frames.len()),
                &output.frame_path(i + 1),
            )?;
            ctx.run(&invocation)?;
        }
        ctx.exec.sink.on_finished();

        let mut report = StageReport::new(Stage::Processed);
        report.frames = output.count()?;
        Ok(report)
    }

    fn validate_output(&self, ctx: &StageContext, report: &StageReport) -> StageResult<()> {
        let expected = ctx.store(Stage::Resized)?.count()?;
        if report.frames != expected {
            return Err(StageError::invalid_output(format!(
                "Processed {} of {} frames",
                report.frames, expected
            )));
        }
        Ok(())
    }
}
