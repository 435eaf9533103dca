//! Staged processing pipeline.
//!
//! Four stages run in order, each reading the previous one's output:
//!
//! 1. Extract - source media to `original/`
//! 2. Crop and Resize - `original/` to `resized/`
//! 3. Effects - `resized/` to `processed/`
//! 4. Generate - `processed/` to the output file
//!
//! [`PipelineController`] asks the invalidation tracker which stages are
//! stale and runs only those. Stage runners implement [`StageRunner`].

mod controller;
pub mod errors;
mod stage;
pub mod stages;
pub mod timing;
mod types;

pub use controller::PipelineController;
pub use errors::{diagnose, PipelineError, PipelineResult, StageError, StageResult};
pub use stage::StageRunner;
pub use types::{RunReport, StageContext, StageReport, WorkLayout};
