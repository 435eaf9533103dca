//! Settings struct with TOML-based sections.
//!
//! Settings are organized into logical sections that map to TOML tables.
//! The four pipeline sections (`timing`, `size`, `effects`, `output`) each
//! feed exactly one [`SettingsCategory`]; a field-level diff between two
//! `Settings` values yields the change counters the invalidation tracker
//! consumes. `behavior.auto_cull_duplicates` also counts as a time/rate
//! change since it decides which extracted frames survive.

use std::collections::BTreeMap;
use std::path::Path;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::invalidation::SettingsCategory;
use crate::media::parse_duration_ms;

/// Most frames the numbering scheme can hold.
pub const MAX_FRAMES: u32 = 9999;

/// Root settings structure containing all configuration sections.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Tool locations and working directories.
    #[serde(default)]
    pub paths: PathSettings,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingSettings,

    /// Start time, duration and frame rate.
    #[serde(default)]
    pub timing: TimingSettings,

    /// Crop and final size.
    #[serde(default)]
    pub size: SizeSettings,

    /// Color effects, captions and palette.
    #[serde(default)]
    pub effects: EffectsSettings,

    /// Output file, playback and audio.
    #[serde(default)]
    pub output: OutputSettings,

    /// Pipeline behavior switches.
    #[serde(default)]
    pub behavior: BehaviorSettings,
}

/// Tool paths and directories.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathSettings {
    /// ffmpeg executable (name on PATH or absolute path).
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: String,

    /// ImageMagick `convert` executable.
    #[serde(default = "default_convert")]
    pub convert: String,

    /// gifsicle executable.
    #[serde(default = "default_gifsicle")]
    pub gifsicle: String,

    /// Session working directory holding the stage frame folders.
    #[serde(default = "default_work_dir")]
    pub work_dir: String,

    /// Folder for log files.
    #[serde(default = "default_logs_folder")]
    pub logs_folder: String,
}

fn default_ffmpeg() -> String {
    "ffmpeg".to_string()
}

fn default_convert() -> String {
    "convert".to_string()
}

fn default_gifsicle() -> String {
    "gifsicle".to_string()
}

fn default_work_dir() -> String {
    ".igf_work".to_string()
}

fn default_logs_folder() -> String {
    ".logs".to_string()
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            ffmpeg: default_ffmpeg(),
            convert: default_convert(),
            gifsicle: default_gifsicle(),
            work_dir: default_work_dir(),
            logs_folder: default_logs_folder(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Filter progress lines in the session log.
    #[serde(default = "default_true")]
    pub compact: bool,

    /// Number of tool output lines to show on failure.
    #[serde(default = "default_error_tail")]
    pub error_tail: u32,

    /// Progress update step percentage in compact mode.
    #[serde(default = "default_progress_step")]
    pub progress_step: u32,

    /// Default tracing level when `RUST_LOG` is unset.
    #[serde(default = "default_level")]
    pub level: String,

    /// Also write tracing events to a daily file in the logs folder.
    #[serde(default = "default_true")]
    pub file_events: bool,
}

fn default_true() -> bool {
    true
}

fn default_error_tail() -> u32 {
    20
}

fn default_progress_step() -> u32 {
    20
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            compact: true,
            error_tail: default_error_tail(),
            progress_step: default_progress_step(),
            level: default_level(),
            file_events: true,
        }
    }
}

/// `start_time` value that picks a start inside the video at extraction.
pub const RANDOM_START: &str = "random";

/// What part of the source becomes frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingSettings {
    /// Start time as `HH:MM:SS.fff`, or `random`.
    #[serde(default = "default_start_time")]
    pub start_time: String,

    /// Clip length in seconds.
    #[serde(default = "default_duration")]
    pub duration_sec: f64,

    /// Extraction frame rate.
    #[serde(default = "default_frame_rate")]
    pub frame_rate: u32,

    /// Start two seconds early and drop those frames to dodge the ffmpeg
    /// slowdown glitch at the seek point.
    #[serde(default)]
    pub fix_slowdown_glitch: bool,
}

fn default_start_time() -> String {
    "00:00:00.000".to_string()
}

fn default_duration() -> f64 {
    5.0
}

fn default_frame_rate() -> u32 {
    10
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            start_time: default_start_time(),
            duration_sec: default_duration(),
            frame_rate: default_frame_rate(),
            fix_slowdown_glitch: false,
        }
    }
}

impl TimingSettings {
    /// Frames the extraction will produce.
    pub fn expected_frames(&self) -> u32 {
        (self.duration_sec * self.frame_rate as f64).max(0.0) as u32
    }

    /// Fixed start in milliseconds. A random start reads as 0.
    pub fn start_ms(&self) -> u64 {
        parse_duration_ms(&self.start_time).unwrap_or(0)
    }

    pub fn is_random_start(&self) -> bool {
        self.start_time.trim().eq_ignore_ascii_case(RANDOM_START)
    }

    /// Start for this extraction. A random start is drawn from
    /// `0..length_ms`, which must be known.
    pub fn resolve_start_ms(
        &self,
        length_ms: Option<u64>,
        rng: &mut impl Rng,
    ) -> Result<u64, String> {
        if !self.is_random_start() {
            return Ok(self.start_ms());
        }
        match length_ms {
            Some(len) if len > 0 => Ok(rng.random_range(0..len)),
            _ => Err("A random start time needs a source of known length".to_string()),
        }
    }
}

/// Crop rectangle and output dimensions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizeSettings {
    #[serde(default)]
    pub crop_enabled: bool,

    #[serde(default)]
    pub crop_x: u32,

    #[serde(default)]
    pub crop_y: u32,

    #[serde(default)]
    pub crop_width: u32,

    #[serde(default)]
    pub crop_height: u32,

    /// Final width; 0 derives it from the height and the crop aspect.
    #[serde(default = "default_output_width")]
    pub output_width: u32,

    /// Final height; 0 derives it from the width and the crop aspect.
    #[serde(default)]
    pub output_height: u32,
}

fn default_output_width() -> u32 {
    480
}

impl Default for SizeSettings {
    fn default() -> Self {
        Self {
            crop_enabled: false,
            crop_x: 0,
            crop_y: 0,
            crop_width: 0,
            crop_height: 0,
            output_width: default_output_width(),
            output_height: 0,
        }
    }
}

impl SizeSettings {
    /// Size of the region kept from a `source_w`x`source_h` frame.
    pub fn cropped_size(&self, source_w: u32, source_h: u32) -> (u32, u32) {
        if self.crop_enabled && self.crop_width > 0 && self.crop_height > 0 {
            (self.crop_width, self.crop_height)
        } else {
            (source_w, source_h)
        }
    }

    /// Final frame dimensions for a `source_w`x`source_h` source.
    pub fn output_size(&self, source_w: u32, source_h: u32) -> (u32, u32) {
        let (cw, ch) = self.cropped_size(source_w, source_h);
        let (cw, ch) = (cw.max(1) as f64, ch.max(1) as f64);

        let (w, h) = match (self.output_width, self.output_height) {
            (0, 0) => (cw, ch),
            (w, 0) => (w as f64, (w as f64 * ch / cw).round()),
            (0, h) => ((h as f64 * cw / ch).round(), h as f64),
            (w, h) => (w as f64, h as f64),
        };
        ((w as u32).max(1), (h as u32).max(1))
    }
}

/// Anchor for a caption.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptionPosition {
    TopLeft,
    Top,
    TopRight,
    MiddleLeft,
    Center,
    MiddleRight,
    BottomLeft,
    #[default]
    Bottom,
    BottomRight,
}

impl CaptionPosition {
    /// ImageMagick `-gravity` value.
    pub fn gravity(&self) -> &'static str {
        match self {
            CaptionPosition::TopLeft => "NorthWest",
            CaptionPosition::Top => "North",
            CaptionPosition::TopRight => "NorthEast",
            CaptionPosition::MiddleLeft => "West",
            CaptionPosition::Center => "Center",
            CaptionPosition::MiddleRight => "East",
            CaptionPosition::BottomLeft => "SouthWest",
            CaptionPosition::Bottom => "South",
            CaptionPosition::BottomRight => "SouthEast",
        }
    }
}

/// One text overlay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptionSettings {
    pub text: String,

    #[serde(default = "default_font")]
    pub font: String,

    #[serde(default = "default_font_size")]
    pub size: u32,

    #[serde(default = "default_caption_color")]
    pub color: String,

    #[serde(default = "default_outline_color")]
    pub outline_color: String,

    #[serde(default = "default_outline_thickness")]
    pub outline_thickness: u32,

    #[serde(default)]
    pub position: CaptionPosition,

    /// Percent, 0..=100.
    #[serde(default = "default_opacity")]
    pub opacity: u32,

    /// First frame showing the caption (1-based, inclusive).
    #[serde(default = "default_frame_start")]
    pub frame_start: u32,

    /// Last frame showing the caption (inclusive).
    #[serde(default = "default_frame_end")]
    pub frame_end: u32,

    /// Draw before the effects chain so effects apply to the text too.
    #[serde(default)]
    pub apply_effects: bool,

    #[serde(default)]
    pub drop_shadow: bool,

    #[serde(default)]
    pub interline_spacing: i32,
}

fn default_font() -> String {
    "Arial".to_string()
}

fn default_font_size() -> u32 {
    24
}

fn default_caption_color() -> String {
    "#ffffff".to_string()
}

fn default_outline_color() -> String {
    "#000000".to_string()
}

fn default_outline_thickness() -> u32 {
    1
}

fn default_opacity() -> u32 {
    100
}

fn default_frame_start() -> u32 {
    1
}

fn default_frame_end() -> u32 {
    MAX_FRAMES
}

impl CaptionSettings {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            font: default_font(),
            size: default_font_size(),
            color: default_caption_color(),
            outline_color: default_outline_color(),
            outline_thickness: default_outline_thickness(),
            position: CaptionPosition::default(),
            opacity: default_opacity(),
            frame_start: default_frame_start(),
            frame_end: default_frame_end(),
            apply_effects: false,
            drop_shadow: false,
            interline_spacing: 0,
        }
    }

    /// Whether the caption is drawn on 1-based frame `index`.
    pub fn shows_on(&self, index: u32) -> bool {
        !self.text.is_empty() && index >= self.frame_start && index <= self.frame_end
    }
}

/// Color effects and captions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectsSettings {
    /// -100..=100
    #[serde(default)]
    pub brightness: i32,

    /// -100..=100
    #[serde(default)]
    pub contrast: i32,

    /// -100..=100
    #[serde(default)]
    pub saturation: i32,

    #[serde(default)]
    pub sharpen: bool,

    /// 0..=100; also picks the dither method.
    #[serde(default)]
    pub sharpen_amount: u32,

    #[serde(default)]
    pub sepia: bool,

    #[serde(default = "default_half")]
    pub sepia_amount: u32,

    #[serde(default)]
    pub tint: bool,

    #[serde(default = "default_tint_color")]
    pub tint_color: String,

    #[serde(default = "default_half")]
    pub tint_amount: u32,

    #[serde(default)]
    pub fade_edges: bool,

    #[serde(default = "default_half")]
    pub fade_edge_amount: u32,

    /// 0 disables.
    #[serde(default)]
    pub blur: u32,

    #[serde(default)]
    pub border: bool,

    #[serde(default = "default_half")]
    pub border_amount: u32,

    #[serde(default = "default_border_color")]
    pub border_color: String,

    #[serde(default)]
    pub grayscale: bool,

    /// GIF palette size, 2..=256.
    #[serde(default = "default_num_colors")]
    pub num_colors: u32,

    #[serde(default)]
    pub captions: Vec<CaptionSettings>,
}

fn default_half() -> u32 {
    50
}

fn default_tint_color() -> String {
    "#0000ff".to_string()
}

fn default_border_color() -> String {
    "#000000".to_string()
}

fn default_num_colors() -> u32 {
    256
}

impl Default for EffectsSettings {
    fn default() -> Self {
        Self {
            brightness: 0,
            contrast: 0,
            saturation: 0,
            sharpen: false,
            sharpen_amount: 0,
            sepia: false,
            sepia_amount: default_half(),
            tint: false,
            tint_color: default_tint_color(),
            tint_amount: default_half(),
            fade_edges: false,
            fade_edge_amount: default_half(),
            blur: 0,
            border: false,
            border_amount: default_half(),
            border_color: default_border_color(),
            grayscale: false,
            num_colors: default_num_colors(),
            captions: Vec::new(),
        }
    }
}

/// Output container chosen by the output path's extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Gif,
    Mp4,
    WebM,
}

impl OutputKind {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_string_lossy().to_lowercase();
        match ext.as_str() {
            "gif" => Some(OutputKind::Gif),
            "mp4" => Some(OutputKind::Mp4),
            "webm" => Some(OutputKind::WebM),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            OutputKind::Gif => "gif",
            OutputKind::Mp4 => "mp4",
            OutputKind::WebM => "webm",
        }
    }
}

/// One `index:ms` override of a GIF frame delay (index is 0-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTiming {
    pub index: usize,
    pub delay_ms: u32,
}

/// Output file, playback and audio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSettings {
    /// Target file; the extension picks GIF, MP4 or WebM.
    #[serde(default = "default_output_path")]
    pub path: String,

    /// Overwrite the target instead of numbering (`name001.gif`, ...).
    #[serde(default = "default_true")]
    pub overwrite: bool,

    /// GIF loop count, 0 loops forever.
    #[serde(default)]
    pub loops: u32,

    /// Playback speed, -10 (slowest) ..= 10 (fastest).
    #[serde(default)]
    pub speed_modifier: i32,

    /// Per-frame GIF delays as `index:ms,index:ms`.
    #[serde(default)]
    pub custom_frame_timing: String,

    /// Run gifsicle over the finished GIF.
    #[serde(default)]
    pub optimize: bool,

    /// Add an audio track to MP4/WebM output.
    #[serde(default)]
    pub audio_enabled: bool,

    #[serde(default)]
    pub audio_path: String,

    /// Offset into the audio file as `HH:MM:SS.fff` or seconds.
    #[serde(default = "default_audio_start")]
    pub audio_start: String,

    /// Percent.
    #[serde(default = "default_volume")]
    pub audio_volume: u32,
}

fn default_output_path() -> String {
    "igf_output/animation.gif".to_string()
}

fn default_audio_start() -> String {
    "0".to_string()
}

fn default_volume() -> u32 {
    100
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            path: default_output_path(),
            overwrite: true,
            loops: 0,
            speed_modifier: 0,
            custom_frame_timing: String::new(),
            optimize: false,
            audio_enabled: false,
            audio_path: String::new(),
            audio_start: default_audio_start(),
            audio_volume: default_volume(),
        }
    }
}

impl OutputSettings {
    pub fn kind(&self) -> Option<OutputKind> {
        OutputKind::from_path(Path::new(&self.path))
    }

    /// Parse `custom_frame_timing`. Empty input is an empty list.
    pub fn frame_timings(&self) -> Result<Vec<FrameTiming>, String> {
        self.custom_frame_timing
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|entry| {
                let (idx, ms) = entry
                    .split_once(':')
                    .ok_or_else(|| format!("Invalid frame timing '{}'", entry))?;
                Ok(FrameTiming {
                    index: idx
                        .trim()
                        .parse()
                        .map_err(|_| format!("Invalid frame index in '{}'", entry))?,
                    delay_ms: ms
                        .trim()
                        .parse()
                        .map_err(|_| format!("Invalid delay in '{}'", entry))?,
                })
            })
            .collect()
    }
}

/// Pipeline behavior switches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorSettings {
    /// Delete duplicate frames right after extraction.
    #[serde(default)]
    pub auto_cull_duplicates: bool,

    /// Ask before extracting more frames than this.
    #[serde(default = "default_large_gif_frames")]
    pub large_gif_frames: u32,

    /// Letterbox imported frames instead of stretching them.
    #[serde(default = "default_true")]
    pub import_keep_aspect: bool,
}

fn default_large_gif_frames() -> u32 {
    500
}

impl Default for BehaviorSettings {
    fn default() -> Self {
        Self {
            auto_cull_duplicates: false,
            large_gif_frames: default_large_gif_frames(),
            import_keep_aspect: true,
        }
    }
}

/// Names of config sections for targeted updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigSection {
    Paths,
    Logging,
    Timing,
    Size,
    Effects,
    Output,
    Behavior,
}

impl ConfigSection {
    pub const ALL: [ConfigSection; 7] = [
        ConfigSection::Paths,
        ConfigSection::Logging,
        ConfigSection::Timing,
        ConfigSection::Size,
        ConfigSection::Effects,
        ConfigSection::Output,
        ConfigSection::Behavior,
    ];

    /// Get the TOML table name for this section.
    pub fn table_name(&self) -> &'static str {
        match self {
            ConfigSection::Paths => "paths",
            ConfigSection::Logging => "logging",
            ConfigSection::Timing => "timing",
            ConfigSection::Size => "size",
            ConfigSection::Effects => "effects",
            ConfigSection::Output => "output",
            ConfigSection::Behavior => "behavior",
        }
    }

    /// Comment written above the section in a fresh config file.
    pub fn comment(&self) -> &'static str {
        match self {
            ConfigSection::Paths => "# Tool locations and working directories",
            ConfigSection::Logging => "# Logging configuration",
            ConfigSection::Timing => "# Which part of the source becomes frames",
            ConfigSection::Size => "# Crop and output size",
            ConfigSection::Effects => "# Color effects, captions and palette",
            ConfigSection::Output => "# Output file, playback and audio",
            ConfigSection::Behavior => "# Pipeline behavior",
        }
    }

    /// Change counter this section feeds, if any.
    pub fn category(&self) -> Option<SettingsCategory> {
        match self {
            ConfigSection::Timing => Some(SettingsCategory::TimeRate),
            ConfigSection::Size => Some(SettingsCategory::SizeCrop),
            ConfigSection::Effects => Some(SettingsCategory::ColorEffects),
            ConfigSection::Output => Some(SettingsCategory::OutputFormat),
            _ => None,
        }
    }
}

/// Count top-level fields whose serialized value differs.
fn count_field_changes<T: Serialize>(old: &T, new: &T) -> u32 {
    let (Ok(old), Ok(new)) = (serde_json::to_value(old), serde_json::to_value(new)) else {
        return 1;
    };

    match (old.as_object(), new.as_object()) {
        (Some(o), Some(n)) => {
            let mut keys: Vec<&String> = o.keys().chain(n.keys()).collect();
            keys.sort();
            keys.dedup();
            keys.iter().filter(|k| o.get(k.as_str()) != n.get(k.as_str())).count() as u32
        }
        _ => u32::from(old != new),
    }
}

impl Settings {
    /// Field-level change counts per category between `self` (old) and
    /// `other` (new). Categories with no change are omitted.
    ///
    /// Switching between GIF and video output also counts against
    /// `ColorEffects`, since GIF frames get palette reduction.
    pub fn category_changes(&self, other: &Settings) -> BTreeMap<SettingsCategory, u32> {
        let mut changes: BTreeMap<SettingsCategory, u32> = BTreeMap::new();
        let mut add = |category, n: u32| {
            if n > 0 {
                *changes.entry(category).or_insert(0) += n;
            }
        };

        add(
            SettingsCategory::TimeRate,
            count_field_changes(&self.timing, &other.timing),
        );
        // Culling changes which frames extraction keeps
        if self.behavior.auto_cull_duplicates != other.behavior.auto_cull_duplicates {
            add(SettingsCategory::TimeRate, 1);
        }
        add(
            SettingsCategory::SizeCrop,
            count_field_changes(&self.size, &other.size),
        );
        add(
            SettingsCategory::ColorEffects,
            count_field_changes(&self.effects, &other.effects),
        );
        add(
            SettingsCategory::OutputFormat,
            count_field_changes(&self.output, &other.output),
        );

        let was_gif = self.output.kind() == Some(OutputKind::Gif);
        let is_gif = other.output.kind() == Some(OutputKind::Gif);
        if was_gif != is_gif {
            add(SettingsCategory::ColorEffects, 1);
        }

        changes
    }

    /// Check values the pipeline relies on.
    pub fn validate(&self) -> Result<(), String> {
        if !self.timing.is_random_start() && parse_duration_ms(&self.timing.start_time).is_none() {
            return Err(format!("Invalid start time '{}'", self.timing.start_time));
        }
        if !(self.timing.duration_sec > 0.0) {
            return Err("Duration must be greater than zero".to_string());
        }
        if !(1..=60).contains(&self.timing.frame_rate) {
            return Err("Frame rate must be between 1 and 60".to_string());
        }
        if self.size.crop_enabled && (self.size.crop_width == 0 || self.size.crop_height == 0) {
            return Err("Crop width and height must be non-zero".to_string());
        }
        if !(2..=256).contains(&self.effects.num_colors) {
            return Err("Number of colors must be between 2 and 256".to_string());
        }
        if !(-10..=10).contains(&self.output.speed_modifier) {
            return Err("Speed modifier must be between -10 and 10".to_string());
        }
        if self.output.kind().is_none() {
            return Err(format!(
                "I don't know how to create '{}' files",
                self.output.path
            ));
        }
        self.output.frame_timings()?;
        Ok(())
    }
}
