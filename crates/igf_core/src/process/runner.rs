//! Runs one external process to completion or cancellation.
//!
//! stdout and stderr are drained by two independent reader threads that
//! push raw byte chunks into channels. All interpretation happens on the
//! calling thread in a poll loop, once per `poll_interval`:
//!
//! ```text
//! reader(stdout) ──┐
//!                  ├──> poll loop ──> translator ──> ProgressSink
//! reader(stderr) ──┘        │
//!                           └──> CancelToken? ──> SIGTERM, grace, kill
//! ```
//!
//! Chunks are not split on newlines because ffmpeg rewrites its stats line
//! with bare `\r`.

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, TryRecvError};

use super::cancel::{CancelToken, ProgressSink};
use super::invocation::ProcessInvocation;
use super::translator::OutputChunk;
use super::types::{ProcessError, ProcessOutcome, ProcessResult, ProgressUpdate, ProgressValue};

/// Default time between polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long to keep draining after exit when a grandchild still holds a pipe.
const EXIT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

const READ_BUFFER_SIZE: usize = 8192;

/// Something that can run a [`ProcessInvocation`].
///
/// [`ProcessRunner`] is the real implementation. Pipeline stages and the
/// frame store only see this trait.
pub trait ProcessExecutor: Send + Sync {
    fn execute(
        &self,
        invocation: &ProcessInvocation,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> ProcessResult<ProcessOutcome>;
}

/// Message sent from a reader thread.
enum ReaderMsg {
    Data(Vec<u8>),
    Failed(io::Error),
}

/// Process runner with a fixed poll interval.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    poll_interval: Duration,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Use a different poll interval. Zero is bumped to one millisecond.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Resolve the executable on `PATH` (or check an explicit path).
    pub fn resolve(program: &Path) -> ProcessResult<PathBuf> {
        which::which(program).map_err(|_| ProcessError::ToolNotFound {
            program: program.to_path_buf(),
        })
    }

    /// Run the invocation.
    ///
    /// A nonzero exit is returned as `Ok` with `success == false`. Only
    /// failures to locate, start, or talk to the process are errors.
    pub fn run(
        &self,
        invocation: &ProcessInvocation,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> ProcessResult<ProcessOutcome> {
        let program_name = invocation.program().display().to_string();
        let resolved = Self::resolve(invocation.program())?;

        if cancel.is_cancelled() {
            tracing::debug!("Skipping {}: cancelled before start", invocation.label());
            return Ok(ProcessOutcome {
                cancelled: true,
                ..Default::default()
            });
        }

        let command_line = invocation.command_line();
        tracing::debug!("Running: {}", command_line);

        let mut child = Command::new(&resolved)
            .args(invocation.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ProcessError::SpawnFailed {
                program: program_name.clone(),
                source,
            })?;

        let (out_rx, out_handle) = spawn_reader(child.stdout.take());
        let (err_rx, err_handle) = spawn_reader(child.stderr.take());

        let mut stdout = StreamState::new(out_rx);
        let mut stderr = StreamState::new(err_rx);
        let mut last_progress: Option<ProgressValue> = None;
        let mut cancelled = false;
        let mut exit: Option<(ExitStatus, Instant)> = None;

        let status = loop {
            let new_out = stdout.drain();
            let new_err = stderr.drain();

            // Markers live on the command line, so silent ticks still report
            // while the process runs.
            let has_output = !new_out.is_empty() || !new_err.is_empty();
            if has_output || exit.is_none() {
                let translation = invocation.translator().translate(&OutputChunk {
                    stdout: (!new_out.is_empty()).then_some(new_out.as_str()),
                    stderr: (!new_err.is_empty()).then_some(new_err.as_str()),
                    command_line: &command_line,
                });
                if translation.progress.is_some() {
                    last_progress = translation.progress;
                }
                sink.on_progress(&ProgressUpdate {
                    label: invocation.label().to_string(),
                    progress: last_progress,
                    status: translation.status,
                });
            }

            if invocation.captures_stdout() {
                stdout.keep(new_out);
            }
            stderr.keep(new_err);

            if let Some((status, exited_at)) = exit {
                let drained = stdout.closed && stderr.closed;
                if drained || exited_at.elapsed() >= EXIT_DRAIN_TIMEOUT {
                    break status;
                }
            } else if cancel.is_cancelled() {
                tracing::info!("Cancelling {}", invocation.label());
                cancelled = true;
                let status = terminate(&mut child, invocation.cancel_policy().grace_period)
                    .map_err(|source| ProcessError::Io {
                        program: program_name.clone(),
                        source,
                    })?;
                exit = Some((status, Instant::now()));
                continue;
            } else {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        exit = Some((status, Instant::now()));
                        continue;
                    }
                    Ok(None) => {}
                    Err(source) => {
                        tracing::error!("Lost track of {}: {}", program_name, source);
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(ProcessError::Io {
                            program: program_name,
                            source,
                        });
                    }
                }
            }

            thread::sleep(self.poll_interval);
        };

        // Readers still blocked on an inherited pipe are left to finish on
        // their own; joining them would block until the grandchild exits.
        for handle in [out_handle, err_handle].into_iter().flatten() {
            if handle.is_finished() {
                let _ = handle.join();
            }
        }

        if let Some(source) = stdout.error.take().or_else(|| stderr.error.take()) {
            tracing::error!("I/O error reading from {}: {}", program_name, source);
            return Err(ProcessError::Io {
                program: program_name,
                source,
            });
        }

        if invocation.finalizes_progress() {
            sink.on_finished();
        }

        let outcome = ProcessOutcome {
            success: status.success() && !cancelled,
            exit_code: status.code(),
            stdout: stdout.text,
            stderr: stderr.text,
            cancelled,
        };

        if !outcome.success && !cancelled {
            tracing::warn!(
                "{} exited with {:?}: {}",
                invocation.label(),
                outcome.exit_code,
                outcome.tail(3).join(" | ")
            );
        }

        Ok(outcome)
    }
}

impl ProcessExecutor for ProcessRunner {
    fn execute(
        &self,
        invocation: &ProcessInvocation,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> ProcessResult<ProcessOutcome> {
        self.run(invocation, sink, cancel)
    }
}

/// Per-stream drain state on the poll thread.
struct StreamState {
    rx: Option<Receiver<ReaderMsg>>,
    decoder: Utf8Decoder,
    text: String,
    closed: bool,
    error: Option<io::Error>,
}

impl StreamState {
    fn new(rx: Option<Receiver<ReaderMsg>>) -> Self {
        let closed = rx.is_none();
        Self {
            rx,
            decoder: Utf8Decoder::default(),
            text: String::new(),
            closed,
            error: None,
        }
    }

    /// Pull everything currently queued and decode it.
    fn drain(&mut self) -> String {
        let mut fresh = String::new();
        let Some(rx) = &self.rx else {
            return fresh;
        };

        loop {
            match rx.try_recv() {
                Ok(ReaderMsg::Data(bytes)) => fresh.push_str(&self.decoder.push(&bytes)),
                Ok(ReaderMsg::Failed(e)) => {
                    if self.error.is_none() {
                        self.error = Some(e);
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    fresh.push_str(&self.decoder.finish());
                    self.closed = true;
                    self.rx = None;
                    break;
                }
            }
        }
        fresh
    }

    fn keep(&mut self, fresh: String) {
        if self.text.is_empty() {
            self.text = fresh;
        } else {
            self.text.push_str(&fresh);
        }
    }
}

/// Incremental UTF-8 decoder that holds back a split multi-byte sequence.
#[derive(Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        match std::str::from_utf8(&self.pending) {
            Ok(s) => {
                let out = s.to_string();
                self.pending.clear();
                out
            }
            Err(e) if e.error_len().is_none() => {
                let valid = e.valid_up_to();
                let out = String::from_utf8_lossy(&self.pending[..valid]).into_owned();
                self.pending.drain(..valid);
                out
            }
            Err(_) => {
                let out = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending.clear();
                out
            }
        }
    }

    fn finish(&mut self) -> String {
        let out = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        out
    }
}

fn spawn_reader<R>(pipe: Option<R>) -> (Option<Receiver<ReaderMsg>>, Option<JoinHandle<()>>)
where
    R: Read + Send + 'static,
{
    let Some(mut pipe) = pipe else {
        return (None, None);
    };

    let (tx, rx) = crossbeam_channel::unbounded();
    let handle = thread::spawn(move || {
        let mut buf = [0u8; READ_BUFFER_SIZE];
        loop {
            match pipe.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(ReaderMsg::Data(buf[..n].to_vec())).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    let _ = tx.send(ReaderMsg::Failed(e));
                    break;
                }
            }
        }
    });

    (Some(rx), Some(handle))
}

/// Ask the child to stop, then force it after `grace`.
fn terminate(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    #[cfg(unix)]
    {
        if let Ok(pid) = libc::pid_t::try_from(child.id()) {
            // SAFETY: kill(2) with a pid we spawned and have not yet reaped.
            unsafe {
                libc::kill(pid, libc::SIGTERM);
            }
        }

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[cfg(not(unix))]
    let _ = grace;

    match child.kill() {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::InvalidInput => {}
        Err(e) => return Err(e),
    }
    child.wait()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::process::cancel::NullSink;
    use crate::process::translator::{OutputTranslator, Translation};
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct RecordingSink {
        updates: Mutex<Vec<ProgressUpdate>>,
        finished: Mutex<usize>,
    }

    impl ProgressSink for RecordingSink {
        fn on_progress(&self, update: &ProgressUpdate) {
            self.updates.lock().push(update.clone());
        }

        fn on_finished(&self) {
            *self.finished.lock() += 1;
        }
    }

    fn sh(script: &str) -> ProcessInvocation {
        ProcessInvocation::builder("sh")
            .arg("-c")
            .arg(script)
            .build()
            .unwrap()
    }

    fn runner() -> ProcessRunner {
        ProcessRunner::new().with_poll_interval(Duration::from_millis(20))
    }

    #[test]
    fn captures_both_streams() {
        let outcome = runner()
            .run(&sh("echo out; echo err 1>&2"), &NullSink, &CancelToken::new())
            .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.stdout.trim(), "out");
        assert_eq!(outcome.stderr.trim(), "err");
    }

    #[test]
    fn nonzero_exit_is_not_an_error() {
        let outcome = runner()
            .run(&sh("echo broken 1>&2; exit 3"), &NullSink, &CancelToken::new())
            .unwrap();

        assert!(!outcome.success);
        assert!(!outcome.cancelled);
        assert_eq!(outcome.exit_code, Some(3));
        assert!(outcome.stderr.contains("broken"));
    }

    #[test]
    fn missing_tool_is_reported() {
        let inv = ProcessInvocation::builder("definitely-not-a-real-tool-igf")
            .build()
            .unwrap();
        let err = runner()
            .run(&inv, &NullSink, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, ProcessError::ToolNotFound { .. }));
    }

    #[test]
    fn stdout_can_be_streamed_only() {
        let inv = ProcessInvocation::builder("sh")
            .arg("-c")
            .arg("echo streamed")
            .capture_stdout(false)
            .build()
            .unwrap();
        let outcome = runner().run(&inv, &NullSink, &CancelToken::new()).unwrap();
        assert!(outcome.success);
        assert!(outcome.stdout.is_empty());
    }

    #[test]
    fn progress_persists_between_ticks() {
        let translator = |c: &OutputChunk<'_>| {
            let progress = c
                .stdout
                .filter(|s| s.contains("half"))
                .map(|_| ProgressValue::Percent(50));
            Translation {
                status: c.stdout.map(|s| s.trim().to_string()),
                progress,
            }
        };
        let inv = ProcessInvocation::builder("sh")
            .arg("-c")
            .arg("echo half; sleep 0.1; echo more; sleep 0.1")
            .translator(Arc::new(translator) as Arc<dyn OutputTranslator>)
            .build()
            .unwrap();

        let sink = RecordingSink::default();
        let outcome = runner().run(&inv, &sink, &CancelToken::new()).unwrap();
        assert!(outcome.success);

        let updates = sink.updates.lock();
        let more = updates
            .iter()
            .find(|u| u.status.as_deref() == Some("more"))
            .expect("saw second line");
        assert_eq!(more.progress, Some(ProgressValue::Percent(50)));
        assert_eq!(*sink.finished.lock(), 1);
    }

    #[test]
    fn finalize_can_be_suppressed() {
        let inv = ProcessInvocation::builder("sh")
            .arg("-c")
            .arg("true")
            .finalize_progress(false)
            .build()
            .unwrap();
        let sink = RecordingSink::default();
        runner().run(&inv, &sink, &CancelToken::new()).unwrap();
        assert_eq!(*sink.finished.lock(), 0);
    }

    #[test]
    fn cancellation_stops_the_process_quickly() {
        let inv = ProcessInvocation::builder("sh")
            .arg("-c")
            .arg("echo started; exec sleep 10")
            .grace_period(Duration::from_millis(200))
            .build()
            .unwrap();

        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            trigger.cancel();
        });

        let started = Instant::now();
        let outcome = runner().run(&inv, &NullSink, &cancel).unwrap();
        canceller.join().unwrap();

        assert!(outcome.cancelled);
        assert!(!outcome.success);
        assert!(outcome.stdout.contains("started"));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn already_cancelled_never_spawns() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let outcome = runner().run(&sh("echo nope"), &NullSink, &cancel).unwrap();
        assert!(outcome.cancelled);
        assert!(outcome.stdout.is_empty());
    }

    #[test]
    fn decoder_holds_split_characters() {
        let mut decoder = Utf8Decoder::default();
        let bytes = "é".as_bytes();
        assert_eq!(decoder.push(&bytes[..1]), "");
        assert_eq!(decoder.push(&bytes[1..]), "é");
        assert_eq!(decoder.finish(), "");
    }
}
