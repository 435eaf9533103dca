//! Stage runner trait definition.

use super::errors::StageResult;
use super::types::{StageContext, StageReport};
use crate::invalidation::Stage;

/// One stage of the pipeline.
///
/// The controller calls, in order:
///
/// 1. `validate_input` - check the upstream output is usable
/// 2. `execute` - clear the stage output and write it again
/// 3. `validate_output` - verify something usable was written
pub trait StageRunner: Send + Sync {
    fn stage(&self) -> Stage;

    /// Name for logging and error context.
    fn name(&self) -> &str {
        self.stage().name()
    }

    fn validate_input(&self, ctx: &StageContext) -> StageResult<()>;

    fn execute(&self, ctx: &StageContext) -> StageResult<StageReport>;

    fn validate_output(&self, ctx: &StageContext, report: &StageReport) -> StageResult<()>;
}
