//! Immutable description of one external tool call.
//!
//! Invocations are always built through [`InvocationBuilder`], which keeps
//! arguments as discrete tokens. Nothing is ever joined into a shell string,
//! so paths with spaces or quotes need no escaping.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::translator::{DefaultTranslator, OutputTranslator};
use super::types::{ProcessError, ProcessResult};

/// Default time between graceful termination and force kill.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_millis(500);

/// How a cancelled process is stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelPolicy {
    /// Time to wait after the graceful signal before force-killing.
    pub grace_period: Duration,
}

impl Default for CancelPolicy {
    fn default() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }
}

/// One external tool call.
#[derive(Clone)]
pub struct ProcessInvocation {
    label: String,
    program: PathBuf,
    args: Vec<OsString>,
    translator: Arc<dyn OutputTranslator>,
    capture_stdout: bool,
    finalize_progress: bool,
    cancel_policy: CancelPolicy,
}

impl ProcessInvocation {
    /// Start building an invocation of `program`.
    pub fn builder(program: impl Into<PathBuf>) -> InvocationBuilder {
        InvocationBuilder::new(program)
    }

    /// Short label for logs and progress.
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    pub fn translator(&self) -> &dyn OutputTranslator {
        self.translator.as_ref()
    }

    /// Whether stdout is kept for the caller, or only streamed for progress.
    pub fn captures_stdout(&self) -> bool {
        self.capture_stdout
    }

    /// Whether the sink is told the operation finished when the process exits.
    pub fn finalizes_progress(&self) -> bool {
        self.finalize_progress
    }

    pub fn cancel_policy(&self) -> CancelPolicy {
        self.cancel_policy
    }

    /// Last argument, which for every tool driven here is the output path.
    pub fn output_arg(&self) -> Option<&OsStr> {
        self.args.last().map(|a| a.as_os_str())
    }

    /// Quoted command line, for logs and marker translation.
    pub fn command_line(&self) -> String {
        let mut line = format!("\"{}\"", self.program.display());
        for arg in &self.args {
            line.push_str(" \"");
            line.push_str(&arg.to_string_lossy());
            line.push('"');
        }
        line
    }
}

impl fmt::Debug for ProcessInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessInvocation")
            .field("label", &self.label)
            .field("command", &self.command_line())
            .field("capture_stdout", &self.capture_stdout)
            .finish()
    }
}

/// Builder for [`ProcessInvocation`].
pub struct InvocationBuilder {
    label: Option<String>,
    program: PathBuf,
    args: Vec<OsString>,
    translator: Arc<dyn OutputTranslator>,
    capture_stdout: bool,
    finalize_progress: bool,
    cancel_policy: CancelPolicy,
}

impl InvocationBuilder {
    fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            label: None,
            program: program.into(),
            args: Vec::new(),
            translator: Arc::new(DefaultTranslator),
            capture_stdout: true,
            finalize_progress: true,
            cancel_policy: CancelPolicy::default(),
        }
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    /// Append a `-comment "label:percent"` progress marker.
    ///
    /// The marker is read back by [`DefaultTranslator`]; `-1` means busy.
    pub fn progress_marker(mut self, label: &str, percent: i64) -> Self {
        self.args.push("-comment".into());
        self.args.push(format!("{}:{}", label, percent).into());
        self
    }

    pub fn translator(mut self, translator: Arc<dyn OutputTranslator>) -> Self {
        self.translator = translator;
        self
    }

    pub fn capture_stdout(mut self, capture: bool) -> Self {
        self.capture_stdout = capture;
        self
    }

    pub fn finalize_progress(mut self, finalize: bool) -> Self {
        self.finalize_progress = finalize;
        self
    }

    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.cancel_policy.grace_period = grace;
        self
    }

    /// Validate and build.
    pub fn build(self) -> ProcessResult<ProcessInvocation> {
        let program_str = self.program.to_string_lossy().to_string();

        if self.program.as_os_str().is_empty() {
            return Err(ProcessError::InvalidInvocation {
                program: program_str,
                message: "empty program path".to_string(),
            });
        }

        if let Some(bad) = self
            .args
            .iter()
            .find(|a| a.to_string_lossy().contains('\0'))
        {
            return Err(ProcessError::InvalidInvocation {
                program: program_str,
                message: format!("argument contains NUL byte: {:?}", bad),
            });
        }

        let label = self.label.unwrap_or_else(|| {
            self.program
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| program_str.clone())
        });

        Ok(ProcessInvocation {
            label,
            program: self.program,
            args: self.args,
            translator: self.translator,
            capture_stdout: self.capture_stdout,
            finalize_progress: self.finalize_progress,
            cancel_policy: self.cancel_policy,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_quotes_every_token() {
        let inv = ProcessInvocation::builder("/usr/bin/convert")
            .progress_marker("Crop and Resize", 25)
            .arg("/tmp/my frames/image0001.png")
            .build()
            .unwrap();

        assert_eq!(
            inv.command_line(),
            r#""/usr/bin/convert" "-comment" "Crop and Resize:25" "/tmp/my frames/image0001.png""#
        );
        assert_eq!(inv.label(), "convert");
        assert_eq!(
            inv.output_arg(),
            Some(OsStr::new("/tmp/my frames/image0001.png"))
        );
    }

    #[test]
    fn empty_program_is_rejected() {
        let err = ProcessInvocation::builder("").build().unwrap_err();
        assert!(matches!(err, ProcessError::InvalidInvocation { .. }));
    }

    #[test]
    fn nul_argument_is_rejected() {
        let err = ProcessInvocation::builder("ffmpeg")
            .arg("bad\0arg")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("NUL"));
    }

    #[test]
    fn defaults_capture_and_finalize() {
        let inv = ProcessInvocation::builder("ffmpeg")
            .label("Extract")
            .build()
            .unwrap();
        assert!(inv.captures_stdout());
        assert!(inv.finalizes_progress());
        assert_eq!(inv.cancel_policy().grace_period, DEFAULT_GRACE_PERIOD);
        assert_eq!(inv.label(), "Extract");
    }
}
