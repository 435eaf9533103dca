//! Crop and resize stage: `original/` to `resized/`.

use crate::commands::{convert, step_percent};
use crate::invalidation::Stage;
use crate::pipeline::errors::{StageError, StageResult};
use crate::pipeline::stage::StageRunner;
use crate::pipeline::types::{StageContext, StageReport};

pub struct ResizeStage;

impl StageRunner for ResizeStage {
    fn stage(&self) -> Stage {
        Stage::Resized
    }

    fn validate_input(&self, ctx: &StageContext) -> StageResult<()> {
        if ctx.store(Stage::Extracted)?.is_empty()? {
            return Err(StageError::invalid_input("No extracted frames to resize"));
        }
        Ok(())
    }

    fn execute(&self, ctx: &StageContext) -> StageResult<StageReport> {
        let frames = ctx.store(Stage::Extracted)?.enumerate()?;
        let output = ctx.store(Stage::Resized)?;
        output.ensure_dir()?;
        output.clear()?;

        let source_size = (ctx.params.width, ctx.params.height);
        let (out_w, out_h) = ctx.settings.size.output_size(source_size.0, source_size.1);
        ctx.logger.info(&format!(
            "Resizing {} frame(s) to {}x{}",
            frames.len(),
            out_w,
            out_h
        ));

        for (i, frame) in frames.iter().enumerate() {
            ctx.check_cancelled()?;
            let invocation = convert::crop_resize(
                ctx.exec.tools,
                frame,
                source_size,
                &ctx.settings.size,
                step_percent(i + 1, frames.len()),
                &output.frame_path(i + 1),
            )?;
            ctx.run(&invocation)?;
        }
        ctx.exec.sink.on_finished();

        let mut report = StageReport::new(Stage::Resized);
        report.frames = output.count()?;
        Ok(report)
    }

    fn validate_output(&self, ctx: &StageContext, report: &StageReport) -> StageResult<()> {
        let expected = ctx.store(Stage::Extracted)?.count()?;
        if report.frames != expected {
            return Err(StageError::invalid_output(format!(
                "Resized {} of {} frames",
                report.frames, expected
            )));
        }
        Ok(())
    }
}
