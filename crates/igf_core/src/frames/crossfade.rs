//! Cross-fade: blend the tail of a range into its head so the sequence loops.

use std::fs;

use super::store::check_range;
use super::{run_tool, FrameError, FrameResult, FrameSequenceStore};
use crate::commands::{convert, ExecContext};

/// One blend: frame `b` dissolved into frame `a` (both 1-based), then `b`
/// is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlendStep {
    /// Frame that receives the blend.
    pub a: usize,
    /// Frame dissolved into `a` and then removed.
    pub b: usize,
    /// Share of `b` in the result, 0-100.
    pub blend_percent: u32,
    /// Progress percent reported for this step.
    pub marker_percent: i64,
}

/// Blends that turn frames `start..=end` into a loopable fade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrossFadePlan {
    /// Start frame after any odd-count adjustment.
    pub start: usize,
    /// Last frame of the fade.
    pub end: usize,
    /// Frames covered by the fade (always even).
    pub fade_frames: usize,
    pub steps: Vec<BlendStep>,
}

/// Work out the blends for a fade from `start` to `end` over `total` frames.
///
/// When `start > end` the range wraps past the last frame. An odd count is
/// grown by one frame, forward if possible.
pub fn plan_cross_fade(start: usize, end: usize, total: usize) -> FrameResult<CrossFadePlan> {
    check_range(start.min(end), start.max(end), total)?;

    let mut start = start;
    let mut count = if start > end {
        total - (start - end)
    } else {
        end - start
    };

    if count < 3 {
        return Err(FrameError::CrossFadeTooShort { frames: count });
    }

    if count % 2 == 1 {
        if end < total {
            count += 1;
        } else if start > 1 {
            count += 1;
            start -= 1;
        }
    }

    let len = count / 2;
    let steps = (0..len)
        .map(|x| BlendStep {
            a: (start - 1 + x) % total + 1,
            b: (start - 1 + x + len) % total + 1,
            blend_percent: ((x + 1) * 100 / (len + 1)) as u32,
            marker_percent: (x * 100 / len) as i64,
        })
        .collect();

    Ok(CrossFadePlan {
        start,
        end,
        fade_frames: count,
        steps,
    })
}

impl FrameSequenceStore {
    /// Apply a cross-fade and re-enumerate. Returns the new frame count.
    ///
    /// On failure the frames are re-enumerated before the error is returned,
    /// so the directory stays contiguous.
    pub fn cross_fade(&self, start: usize, end: usize, ctx: &ExecContext<'_>) -> FrameResult<usize> {
        let frames = self.enumerate()?;
        let plan = plan_cross_fade(start, end, frames.len())?;

        tracing::info!(
            "Create cross fade between {} and {} ({} fade frames, {} total)",
            plan.start,
            plan.end,
            plan.fade_frames,
            frames.len()
        );

        let blended = plan.steps.iter().try_for_each(|step| {
            if ctx.is_cancelled() {
                return Err(FrameError::Cancelled);
            }
            let fa = &frames[step.a - 1];
            let fb = &frames[step.b - 1];
            tracing::debug!(
                "xfade {} with {} by {} percent",
                step.a,
                step.b,
                step.blend_percent
            );

            let invocation = convert::dissolve(
                ctx.tools,
                fa,
                fb,
                step.blend_percent,
                step.marker_percent,
            )?;
            run_tool(ctx, &invocation)?;

            fs::remove_file(fb)
                .map_err(|e| FrameError::io(format!("deleting {}", fb.display()), e))
        });

        ctx.sink.on_finished();
        let count = self.re_enumerate()?;
        blended?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::ToolPaths;
    use crate::frames::frame_name;
    use crate::process::testing::RecordingExecutor;
    use crate::process::{CancelToken, NullSink};
    use tempfile::tempdir;

    #[test]
    fn rejects_short_fades() {
        assert!(matches!(
            plan_cross_fade(3, 5, 10),
            Err(FrameError::CrossFadeTooShort { frames: 2 })
        ));
        assert!(matches!(
            plan_cross_fade(4, 4, 10),
            Err(FrameError::CrossFadeTooShort { frames: 0 })
        ));
        assert!(matches!(
            plan_cross_fade(1, 12, 10),
            Err(FrameError::InvalidRange { .. })
        ));
    }

    #[test]
    fn wraps_past_last_frame() {
        let plan = plan_cross_fade(8, 2, 10).unwrap();
        assert_eq!(plan.fade_frames, 4);
        assert_eq!(
            plan.steps,
            vec![
                BlendStep {
                    a: 8,
                    b: 10,
                    blend_percent: 33,
                    marker_percent: 0
                },
                BlendStep {
                    a: 9,
                    b: 1,
                    blend_percent: 66,
                    marker_percent: 50
                },
            ]
        );
    }

    #[test]
    fn odd_count_grows_forward_or_back() {
        let plan = plan_cross_fade(2, 5, 10).unwrap();
        assert_eq!((plan.start, plan.fade_frames), (2, 4));

        let plan = plan_cross_fade(7, 10, 10).unwrap();
        assert_eq!((plan.start, plan.fade_frames), (6, 4));
        assert_eq!(plan.steps[0].a, 6);
    }

    #[test]
    fn cross_fade_removes_blended_frames() {
        let dir = tempdir().unwrap();
        for i in 1..=10 {
            fs::write(dir.path().join(frame_name(i)), format!("f{}", i)).unwrap();
        }
        let store = FrameSequenceStore::new(dir.path());
        let executor = RecordingExecutor::new();
        let tools = ToolPaths::default();
        let cancel = CancelToken::new();
        let ctx = ExecContext::new(&executor, &tools, &NullSink, &cancel);

        assert_eq!(store.cross_fade(8, 2, &ctx).unwrap(), 8);
        assert_eq!(executor.call_count(), 2);
        assert!(executor.calls()[0].has_arg("compose:args=33"));

        // Frame 1 was consumed by the wrap, so old frame 2 is now first.
        assert_eq!(fs::read_to_string(store.frame_path(1)).unwrap(), "f2");
    }
}
