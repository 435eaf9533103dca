//! External process execution engine.
//!
//! Every external tool call (ffmpeg, ImageMagick `convert`, gifsicle) goes
//! through a [`ProcessInvocation`] run by a [`ProcessExecutor`]. Progress is
//! observed through a [`ProgressSink`] and stopped through a [`CancelToken`].

mod cancel;
mod invocation;
mod runner;
mod translator;
mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use cancel::{CallbackSink, CancelToken, NullSink, ProgressCallback, ProgressEvent, ProgressSink};
pub use invocation::{CancelPolicy, InvocationBuilder, ProcessInvocation, DEFAULT_GRACE_PERIOD};
pub use runner::{ProcessExecutor, ProcessRunner, DEFAULT_POLL_INTERVAL};
pub use translator::{DefaultTranslator, OutputChunk, OutputTranslator, SilentTranslator, Translation};
pub use types::{ProcessError, ProcessOutcome, ProcessResult, ProgressUpdate, ProgressValue};
