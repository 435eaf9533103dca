//! Stage runner implementations, one per [`Stage`].

mod effects;
mod extract;
mod generate;
mod resize;

pub use effects::EffectsStage;
pub use extract::ExtractStage;
pub use generate::GenerateStage;
pub use resize::ResizeStage;

use super::stage::StageRunner;
use crate::invalidation::Stage;

/// Runner for `stage`.
pub fn runner_for(stage: Stage) -> Box<dyn StageRunner> {
    match stage {
        Stage::Extracted => Box::new(ExtractStage),
        Stage::Resized => Box::new(ResizeStage),
        Stage::Processed => Box::new(EffectsStage),
        Stage::Generated => Box::new(GenerateStage),
    }
}
