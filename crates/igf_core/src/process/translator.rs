//! Translation of raw tool output into status text and progress.
//!
//! A translator is a pure function over text. It must return an empty
//! [`Translation`] when nothing matches and must never panic on malformed
//! input.

use once_cell::sync::Lazy;
use regex::Regex;

use super::types::ProgressValue;
use crate::media::timecode::parse_duration_ms;

/// Text handed to a translator on each poll tick.
#[derive(Debug, Clone, Copy)]
pub struct OutputChunk<'a> {
    /// Newly read stdout text (may hold several lines or a partial line).
    pub stdout: Option<&'a str>,
    /// Newly read stderr text.
    pub stderr: Option<&'a str>,
    /// Quoted rendering of the invocation's command line.
    pub command_line: &'a str,
}

/// Result of translating one chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Translation {
    pub status: Option<String>,
    pub progress: Option<ProgressValue>,
}

impl Translation {
    /// Nothing recognized.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.progress.is_none()
    }
}

/// Maps process output to status text and progress.
pub trait OutputTranslator: Send + Sync {
    fn translate(&self, chunk: &OutputChunk<'_>) -> Translation;
}

impl<F> OutputTranslator for F
where
    F: Fn(&OutputChunk<'_>) -> Translation + Send + Sync,
{
    fn translate(&self, chunk: &OutputChunk<'_>) -> Translation {
        self(chunk)
    }
}

/// Translator that never reports anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentTranslator;

impl OutputTranslator for SilentTranslator {
    fn translate(&self, _chunk: &OutputChunk<'_>) -> Translation {
        Translation::none()
    }
}

static DOWNLOAD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[download\]\s+([0-9.]+)% of").expect("valid regex"));

static FFMPEG_TIME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"frame=.+?time=(\d+:\d+:\d+\.\d+)").expect("valid regex"));

static COMMENT_MARKER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"-comment"? "([^"]+):(-?\d+)""#).expect("valid regex"));

/// Default translator for the tools this crate drives.
///
/// Recognizes, in this order (later sources override earlier ones):
/// - downloader percentages: `[download]  42.0% of ...`
/// - ffmpeg stats lines: `frame=... time=00:00:03.20 ...`
/// - progress markers embedded in the command line as
///   `-comment "Label:NN"` (`NN == -1` means busy)
///
/// Sources are scanned in the order stdout, stderr, command line.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultTranslator;

impl DefaultTranslator {
    fn scan(text: &str, result: &mut Translation) {
        if let Some(caps) = DOWNLOAD_RE.captures_iter(text).last() {
            if let Ok(pct) = caps[1].parse::<f64>() {
                let pct = pct.clamp(0.0, 100.0) as i64;
                result.progress = Some(ProgressValue::from_raw(pct));
                result.status = Some(format!("Downloaded {}%...", pct));
            }
        }

        if let Some(caps) = FFMPEG_TIME_RE.captures_iter(text).last() {
            if let Some(ms) = parse_duration_ms(&caps[1]) {
                result.status = Some(format!("Extracted {:.1} seconds...", ms as f64 / 1000.0));
            }
        }

        if let Some(caps) = COMMENT_MARKER_RE.captures_iter(text).last() {
            let label = &caps[1];
            if let Ok(raw) = caps[2].parse::<i64>() {
                let value = ProgressValue::from_raw(raw);
                match value {
                    ProgressValue::Busy => {
                        result.status = Some(label.to_string());
                    }
                    ProgressValue::Percent(p) => {
                        result.status = Some(format!("{}% {}", p, label));
                    }
                }
                result.progress = Some(value);
            }
        }
    }
}

impl OutputTranslator for DefaultTranslator {
    fn translate(&self, chunk: &OutputChunk<'_>) -> Translation {
        let mut result = Translation::none();

        for text in [chunk.stdout, chunk.stderr, Some(chunk.command_line)]
            .into_iter()
            .flatten()
        {
            if text.is_empty() {
                continue;
            }
            Self::scan(text, &mut result);
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk<'a>(stdout: Option<&'a str>, stderr: Option<&'a str>, cmd: &'a str) -> OutputChunk<'a> {
        OutputChunk {
            stdout,
            stderr,
            command_line: cmd,
        }
    }

    #[test]
    fn no_match_returns_empty() {
        let t = DefaultTranslator.translate(&chunk(Some("hello"), None, "\"ffmpeg\" \"-i\""));
        assert!(t.is_empty());
    }

    #[test]
    fn parses_download_percent() {
        let t = DefaultTranslator.translate(&chunk(
            Some("[download]   42.7% of 10.00MiB at 1.2MiB/s"),
            None,
            "",
        ));
        assert_eq!(t.progress, Some(ProgressValue::Percent(42)));
        assert_eq!(t.status.as_deref(), Some("Downloaded 42%..."));
    }

    #[test]
    fn parses_ffmpeg_time_without_percent() {
        let stderr = "frame=   12 fps=0.0 q=-0.0 size=N/A time=00:00:03.50 bitrate=N/A\r\
                      frame=   24 fps=0.0 q=-0.0 size=N/A time=00:00:04.20 bitrate=N/A\r";
        let t = DefaultTranslator.translate(&chunk(None, Some(stderr), ""));
        assert_eq!(t.progress, None);
        assert_eq!(t.status.as_deref(), Some("Extracted 4.2 seconds..."));
    }

    #[test]
    fn parses_comment_marker() {
        let cmd = r#""convert" "-comment" "Crop and Resize:40" "-comment" "igf" "in.png""#;
        let t = DefaultTranslator.translate(&chunk(None, None, cmd));
        assert_eq!(t.progress, Some(ProgressValue::Percent(40)));
        assert_eq!(t.status.as_deref(), Some("40% Crop and Resize"));
    }

    #[test]
    fn busy_marker_is_not_zero_percent() {
        let cmd = r#""convert" "-comment" "Importing frames:-1" "a.gif""#;
        let t = DefaultTranslator.translate(&chunk(None, None, cmd));
        assert_eq!(t.progress, Some(ProgressValue::Busy));
        assert_eq!(t.status.as_deref(), Some("Importing frames"));
    }

    #[test]
    fn malformed_input_does_not_panic() {
        let t = DefaultTranslator.translate(&chunk(
            Some("[download] nan% of"),
            Some("frame= time=99:xx"),
            r#""-comment" "x:""#,
        ));
        assert!(t.is_empty());
    }

    #[test]
    fn closures_are_translators() {
        let translator = |c: &OutputChunk<'_>| Translation {
            status: c.stdout.map(|s| s.trim().to_string()),
            progress: None,
        };
        let t = translator.translate(&chunk(Some("done\n"), None, ""));
        assert_eq!(t.status.as_deref(), Some("done"));
    }
}
