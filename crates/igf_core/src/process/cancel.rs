//! Cancellation tokens and progress sinks.
//!
//! Progress reporting and cancellation are two separate channels: a
//! [`ProgressSink`] only observes, a [`CancelToken`] only stops. The
//! [`CallbackSink`] adapter bridges the two for front-ends that speak the
//! `(progress, status) -> keep_going` callback shape.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::types::{ProgressUpdate, ProgressValue};

/// Shared cancellation flag.
///
/// Clones share the same flag. The process runner checks it once per poll
/// tick; the pipeline checks it between frames and between stages.
#[derive(Clone, Default, Debug)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Clear the flag so the token can be reused for the next run.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Receiver of progress updates.
pub trait ProgressSink: Send + Sync {
    /// Called once per poll tick while a process runs, and for per-frame steps.
    fn on_progress(&self, update: &ProgressUpdate);

    /// Called when an operation has finished and the indicator may reset.
    fn on_finished(&self) {}
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn on_progress(&self, _update: &ProgressUpdate) {}
}

/// Event passed to a [`CallbackSink`] closure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// Work in progress.
    Working {
        progress: Option<ProgressValue>,
        status: Option<String>,
    },
    /// Operation finished.
    Done,
}

/// Type of the closure wrapped by [`CallbackSink`].
pub type ProgressCallback = Box<dyn Fn(ProgressEvent) -> bool + Send + Sync>;

/// Adapter for `(progress, status) -> keep_going` callbacks.
///
/// When the callback returns `false` the linked [`CancelToken`] is cancelled.
pub struct CallbackSink {
    callback: ProgressCallback,
    cancel: CancelToken,
}

impl CallbackSink {
    /// Wrap a callback; returns the sink and the token it will cancel.
    pub fn new(callback: ProgressCallback) -> (Self, CancelToken) {
        let cancel = CancelToken::new();
        (
            Self {
                callback,
                cancel: cancel.clone(),
            },
            cancel,
        )
    }
}

impl ProgressSink for CallbackSink {
    fn on_progress(&self, update: &ProgressUpdate) {
        let keep_going = (self.callback)(ProgressEvent::Working {
            progress: update.progress,
            status: update.status.clone(),
        });
        if !keep_going {
            self.cancel.cancel();
        }
    }

    fn on_finished(&self) {
        (self.callback)(ProgressEvent::Done);
    }
}
