//! gifsicle optimization pass.

use std::path::Path;

use super::ToolPaths;
use crate::process::{ProcessInvocation, ProcessResult};

/// Optimize `gif` in place.
pub fn optimize(tools: &ToolPaths, gif: &Path) -> ProcessResult<ProcessInvocation> {
    ProcessInvocation::builder(&tools.gifsicle)
        .label("Optimize")
        .args(["-O3", "--colors", "256"])
        .arg(gif)
        .arg("-o")
        .arg(gif)
        .build()
}
