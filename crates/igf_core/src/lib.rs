//! IGF Core - staged animated GIF pipeline
//!
//! Turns a video or image sequence into a GIF, MP4 or WebM by driving
//! ffmpeg, ImageMagick and gifsicle. Stages are only re-run when their
//! inputs or settings changed. No UI dependencies; front-ends drive the
//! [`pipeline::PipelineController`].

pub mod commands;
pub mod config;
pub mod frames;
pub mod invalidation;
pub mod logging;
pub mod media;
pub mod pipeline;
pub mod process;

/// Returns the crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
