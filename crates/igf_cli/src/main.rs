use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context as _};
use clap::{Parser, Subcommand, ValueEnum};

use igf_core::commands::{ExecContext, ToolPaths};
use igf_core::config::{ConfigManager, Settings};
use igf_core::frames::{ExportRequest, FrameSequenceStore, ImportItem, SpliceRequest};
use igf_core::invalidation::{FixedResolver, Stage};
use igf_core::logging::{self, LogConfig, LogLevel, SessionLogger};
use igf_core::media::MediaSource;
use igf_core::pipeline::PipelineController;
use igf_core::process::{CancelToken, ProcessRunner, ProgressSink, ProgressUpdate, ProgressValue};

const DEFAULT_CONFIG: &str = ".config/igf.toml";

#[derive(Parser, Debug)]
#[command(name = "igf", version, about = "Turn video clips into animated GIFs")]
struct Cli {
    /// Settings file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the pipeline on a video or an image sequence.
    Run(RunArgs),
    /// Inspect or edit a numbered frame directory.
    Frames(FramesArgs),
    /// Manage the settings file.
    Config {
        #[command(subcommand)]
        cmd: ConfigCommand,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StageArg {
    Extracted,
    Resized,
    Processed,
    Generated,
}

impl From<StageArg> for Stage {
    fn from(arg: StageArg) -> Self {
        match arg {
            StageArg::Extracted => Stage::Extracted,
            StageArg::Resized => Stage::Resized,
            StageArg::Processed => Stage::Processed,
            StageArg::Generated => Stage::Generated,
        }
    }
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Video file, or several images in display order.
    #[arg(required = true)]
    media: Vec<PathBuf>,

    /// Last stage to bring up to date.
    #[arg(long, value_enum, default_value_t = StageArg::Generated)]
    stage: StageArg,

    /// Preview run: settings changes stay pending.
    #[arg(long, default_value_t = false)]
    preview: bool,

    /// Work directory for stage frames (overrides the settings file).
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Output file; the extension picks GIF, MP4 or WebM.
    #[arg(long, short)]
    output: Option<PathBuf>,

    /// Start time as HH:MM:SS.fff, or `random`.
    #[arg(long)]
    start: Option<String>,

    /// Clip length in seconds.
    #[arg(long)]
    duration: Option<f64>,

    /// Extraction frame rate.
    #[arg(long)]
    fps: Option<u32>,

    /// Render only this extracted frame into the preview file.
    #[arg(long)]
    preview_frame: Option<usize>,

    /// Go ahead with outputs above the large frame count threshold.
    #[arg(long, short, default_value_t = false)]
    yes: bool,
}

#[derive(Parser, Debug)]
struct FramesArgs {
    /// Directory holding image0001.png, image0002.png, ...
    dir: PathBuf,

    #[command(subcommand)]
    cmd: FramesCommand,
}

#[derive(Subcommand, Debug)]
enum FramesCommand {
    /// List frames in order.
    List,
    /// Close gaps in the numbering.
    Reenumerate,
    /// Reverse the frame order.
    Reverse,
    /// Find identical frames.
    Dedup {
        /// Delete all but the first of each group.
        #[arg(long, default_value_t = false)]
        cull: bool,
    },
    /// Blend frames START..=END into a loop-friendly cross-fade.
    Crossfade { start: usize, end: usize },
    /// Delete frames START..=END.
    Delete { start: usize, end: usize },
    /// Copy frames START..=END into DEST.
    Export {
        start: usize,
        end: usize,
        dest: PathBuf,
        #[arg(long, default_value = "frame")]
        prefix: String,
        /// Rotate each copy by this many degrees.
        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        rotate: i32,
    },
    /// Insert images or solid colors after frame AFTER. A color is written
    /// in angle brackets, e.g. `<#000000>` or `<black>`.
    Import {
        after: usize,
        #[arg(required = true)]
        items: Vec<String>,
        /// Frame size as WIDTHxHEIGHT.
        #[arg(long, default_value = "480x270")]
        size: String,
        #[arg(long, default_value_t = false)]
        riffle: bool,
        #[arg(long, default_value_t = false)]
        reverse: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Write the settings file with defaults filled in.
    Init,
    /// Print the effective settings.
    Show,
    /// Change one setting, e.g. `igf config set timing.frame_rate 15`.
    Set {
        /// `section.field`
        key: String,
        value: String,
    },
}

/// Progress on one stderr line.
#[derive(Default)]
struct StderrProgress {
    dirty: AtomicBool,
}

impl ProgressSink for StderrProgress {
    fn on_progress(&self, update: &ProgressUpdate) {
        let detail = match (update.progress, &update.status) {
            (_, Some(status)) => status.clone(),
            (Some(ProgressValue::Percent(p)), None) => format!("{}%", p),
            (Some(ProgressValue::Busy), None) => "working".to_string(),
            (None, None) => return,
        };
        let mut err = std::io::stderr().lock();
        let _ = write!(err, "\r\x1b[2K{}: {}", update.label, detail);
        let _ = err.flush();
        self.dirty.store(true, Ordering::Relaxed);
    }

    fn on_finished(&self) {
        if self.dirty.swap(false, Ordering::Relaxed) {
            eprintln!();
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.cmd {
        Command::Run(args) => cmd_run(&cli.config, args),
        Command::Frames(args) => cmd_frames(&cli.config, args),
        Command::Config { cmd } => cmd_config(&cli.config, cmd),
    }
}

fn load_settings(config_path: &Path) -> anyhow::Result<Settings> {
    let mut config = ConfigManager::new(config_path);
    config
        .load_or_create()
        .with_context(|| format!("load settings '{}'", config_path.display()))?;
    Ok(config.settings().clone())
}

/// Install the tracing subscriber. Keep the guard alive until exit.
fn init_logging(settings: &Settings) -> anyhow::Result<Option<logging::WorkerGuard>> {
    let level: LogLevel = settings.logging.level.parse().unwrap_or_default();
    if settings.logging.file_events {
        let guard = logging::init_file_tracing(Path::new(&settings.paths.logs_folder), level)
            .context("open event log")?;
        Ok(Some(guard))
    } else {
        logging::init_tracing(level);
        Ok(None)
    }
}

fn cmd_run(config_path: &Path, args: RunArgs) -> anyhow::Result<()> {
    let mut settings = load_settings(config_path)?;
    if let Some(dir) = &args.work_dir {
        settings.paths.work_dir = dir.display().to_string();
    }
    if let Some(output) = &args.output {
        settings.output.path = output.display().to_string();
    }
    if let Some(start) = args.start {
        settings.timing.start_time = start;
    }
    if let Some(duration) = args.duration {
        settings.timing.duration_sec = duration;
    }
    if let Some(fps) = args.fps {
        settings.timing.frame_rate = fps;
    }

    let _guard = init_logging(&settings)?;
    tracing::info!("igf {}", igf_core::version());

    let logger = Arc::new(
        SessionLogger::new(
            "session",
            &settings.paths.logs_folder,
            LogConfig::from_settings(&settings.logging),
            None,
        )
        .context("open session log")?,
    );

    let source = MediaSource::from_inputs(args.media)?;
    let resolver = FixedResolver {
        discard_edits: true,
        allow_large_output: args.yes,
    };
    let mut controller =
        PipelineController::new(settings, source, Arc::new(ProcessRunner::new()), logger.clone())
            .map_err(|e| anyhow!(e.user_message()))?
            .with_resolver(Box::new(resolver));

    let sink = StderrProgress::default();
    let cancel = CancelToken::new();
    let fail = |e: igf_core::pipeline::PipelineError| {
        anyhow!(
            "{}\nDetails in {}",
            e.user_message(),
            logger.log_path().display()
        )
    };

    if let Some(index) = args.preview_frame {
        controller
            .process_up_to(Stage::Extracted, true, &sink, &cancel)
            .map_err(fail)?;
        let path = controller
            .preview_frame(index, &sink, &cancel)
            .map_err(fail)?;
        eprintln!("wrote {}", path.display());
        return Ok(());
    }

    let report = controller
        .process_up_to(args.stage.into(), args.preview, &sink, &cancel)
        .map_err(fail)?;

    if report.was_noop() {
        eprintln!("{} is up to date", report.target);
    }
    for stage in &report.stages {
        eprintln!(
            "{}: {} frame(s){}",
            stage.stage,
            stage.frames,
            if stage.skipped_items > 0 {
                format!(", {} skipped", stage.skipped_items)
            } else {
                String::new()
            }
        );
    }
    if let Some(output) = controller.last_output() {
        eprintln!("wrote {}", output.display());
    }
    Ok(())
}

fn parse_size(text: &str) -> anyhow::Result<(u32, u32)> {
    let (w, h) = text
        .split_once(['x', 'X'])
        .ok_or_else(|| anyhow!("size '{}' is not WIDTHxHEIGHT", text))?;
    Ok((w.trim().parse()?, h.trim().parse()?))
}

fn cmd_frames(config_path: &Path, args: FramesArgs) -> anyhow::Result<()> {
    logging::init_tracing(LogLevel::Warn);
    let store = FrameSequenceStore::new(&args.dir);
    if !store.dir().is_dir() {
        bail!("'{}' is not a directory", args.dir.display());
    }

    match args.cmd {
        FramesCommand::List => {
            for frame in store.enumerate()? {
                println!("{}", frame.display());
            }
        }
        FramesCommand::Reenumerate => {
            let n = store.re_enumerate()?;
            eprintln!("{} frame(s)", n);
        }
        FramesCommand::Reverse => {
            let n = store.reverse()?;
            eprintln!("reversed {} frame(s)", n);
        }
        FramesCommand::Dedup { cull } => {
            let report = store.detect_duplicates(cull)?;
            for group in &report.groups {
                let names: Vec<String> = group
                    .iter()
                    .filter_map(|p| p.file_name())
                    .map(|n| n.to_string_lossy().to_string())
                    .collect();
                println!("{}", names.join(" "));
            }
            eprintln!(
                "{} duplicate(s){}",
                report.duplicates.len(),
                if cull { " removed" } else { "" }
            );
        }
        FramesCommand::Delete { start, end } => {
            let n = store.delete_range(start, end)?;
            eprintln!("deleted {} frame(s)", n);
        }
        FramesCommand::Export {
            start,
            end,
            dest,
            prefix,
            rotate,
        } => {
            let mut request = ExportRequest::new(start, end, dest);
            request.prefix = prefix;
            request.rotate_degrees = rotate;

            let tools = ToolPaths::from_settings(&load_settings(config_path)?.paths);
            let runner = ProcessRunner::new();
            let sink = StderrProgress::default();
            let cancel = CancelToken::new();
            let ctx = ExecContext::new(&runner, &tools, &sink, &cancel);
            let report = store.export(&request, &ctx)?;
            for (path, err) in &report.failed {
                eprintln!("failed {}: {}", path.display(), err);
            }
            eprintln!("exported {} frame(s)", report.exported.len());
        }
        FramesCommand::Crossfade { start, end } => {
            let tools = ToolPaths::from_settings(&load_settings(config_path)?.paths);
            let runner = ProcessRunner::new();
            let sink = StderrProgress::default();
            let cancel = CancelToken::new();
            let ctx = ExecContext::new(&runner, &tools, &sink, &cancel);
            let n = store.cross_fade(start, end, &ctx)?;
            eprintln!("blended {} frame(s)", n);
        }
        FramesCommand::Import {
            after,
            items,
            size,
            riffle,
            reverse,
        } => {
            let settings = load_settings(config_path)?;
            let tools = ToolPaths::from_settings(&settings.paths);
            let mut request = SpliceRequest::new(
                items.iter().map(|i| ImportItem::parse(i)).collect(),
                after,
                parse_size(&size)?,
            );
            request.riffle = riffle;
            request.reverse = reverse;
            request.keep_aspect = settings.behavior.import_keep_aspect;

            let runner = ProcessRunner::new();
            let sink = StderrProgress::default();
            let cancel = CancelToken::new();
            let ctx = ExecContext::new(&runner, &tools, &sink, &cancel);
            let report = store.splice(&request, &ctx)?;
            for missing in &report.skipped {
                eprintln!("not found: {}", missing.display());
            }
            eprintln!("inserted {} frame(s), {} total", report.inserted, report.total);
        }
    }
    Ok(())
}

fn cmd_config(config_path: &Path, cmd: ConfigCommand) -> anyhow::Result<()> {
    match cmd {
        ConfigCommand::Init => {
            let mut config = ConfigManager::new(config_path);
            config
                .load_or_create()
                .with_context(|| format!("write settings '{}'", config_path.display()))?;
            config.create_dirs()?;
            eprintln!("settings in {}", config_path.display());
        }
        ConfigCommand::Show => {
            let settings = load_settings(config_path)?;
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
        ConfigCommand::Set { key, value } => {
            let mut config = ConfigManager::new(config_path);
            config
                .load_or_create()
                .with_context(|| format!("load settings '{}'", config_path.display()))?;
            let section = config.set_value(&key, &value)?;
            eprintln!("updated [{}] in {}", section.table_name(), config_path.display());
        }
    }
    Ok(())
}
