//! ImageMagick `convert` invocations.
//!
//! Per-frame calls carry a `-comment "Label:NN"` progress marker followed by
//! a plain `-comment igf`, so the label is reported as progress but is not
//! the comment stamped into the written image.

use std::path::Path;

use super::{rescale, ToolPaths};
use crate::config::{CaptionSettings, EffectsSettings, FrameTiming, SizeSettings};
use crate::process::{InvocationBuilder, ProcessInvocation, ProcessResult};

/// Gap between a caption and the frame edge, in pixels.
const CAPTION_MARGIN: i32 = 3;

fn marked(tools: &ToolPaths, label: &str, percent: i64) -> InvocationBuilder {
    ProcessInvocation::builder(&tools.convert)
        .label(label)
        .progress_marker(label, percent)
        .args(["-comment", "igf"])
        .finalize_progress(false)
}

/// Solid `color` frame of `width`x`height`.
pub fn blank_frame(
    tools: &ToolPaths,
    width: u32,
    height: u32,
    color: &str,
    output: &Path,
) -> ProcessResult<ProcessInvocation> {
    ProcessInvocation::builder(&tools.convert)
        .label("Blank frame")
        .arg("-size")
        .arg(format!("{}x{}", width, height))
        .arg(format!("xc:{}", color))
        .arg(output)
        .build()
}

/// Resize an imported image to the frame size.
///
/// `keep_aspect` letterboxes on black; otherwise the image is stretched.
/// Multi-frame inputs such as GIFs fan out to `output-0.png`, `output-1.png`.
pub fn import_frame(
    tools: &ToolPaths,
    input: &Path,
    width: u32,
    height: u32,
    keep_aspect: bool,
    percent: i64,
    output: &Path,
) -> ProcessResult<ProcessInvocation> {
    let builder = marked(tools, "Importing frames", percent)
        .arg(input)
        .arg("-resize");

    let builder = if keep_aspect {
        builder
            .arg(format!("{}x{}", width, height))
            .args(["-background", "black", "-gravity", "center", "-extent"])
            .arg(format!("{}x{}", width, height))
    } else {
        builder.arg(format!("{}x{}!", width, height))
    };

    builder.arg(output).build()
}

/// Convert one image of a source sequence into a numbered frame.
pub fn sequence_frame(
    tools: &ToolPaths,
    input: &Path,
    width: u32,
    height: u32,
    percent: i64,
    output: &Path,
) -> ProcessResult<ProcessInvocation> {
    marked(tools, "Importing image sequence", percent)
        .arg(input)
        .arg("-resize")
        .arg(format!("{}x{}!", width, height))
        .args(["+set", "date:create", "+set", "date:modify"])
        .arg(output)
        .build()
}

/// Blend `b` over `a` at `blend_percent` and write the result to `a`.
pub fn dissolve(
    tools: &ToolPaths,
    a: &Path,
    b: &Path,
    blend_percent: u32,
    marker_percent: i64,
) -> ProcessResult<ProcessInvocation> {
    ProcessInvocation::builder(&tools.convert)
        .label("Creating cross-fade")
        .progress_marker("Creating cross-fade", marker_percent)
        .arg(a)
        .arg(b)
        .args(["-alpha", "on", "-compose", "dissolve", "-define"])
        .arg(format!("compose:args={}", blend_percent))
        .arg("-composite")
        .arg(a)
        .finalize_progress(false)
        .build()
}

/// Rotate an exported frame in place, flattening any transparency the
/// rotation leaves in the corners.
pub fn rotate(
    tools: &ToolPaths,
    image: &Path,
    degrees: i32,
    percent: i64,
) -> ProcessResult<ProcessInvocation> {
    marked(tools, "Exporting frames", percent)
        .arg(image)
        .arg("-rotate")
        .arg(degrees.to_string())
        .args(["-alpha", "remove", "-alpha", "off"])
        .arg(image)
        .build()
}

/// Normalize, strip, crop and resize one frame.
pub fn crop_resize(
    tools: &ToolPaths,
    input: &Path,
    source_size: (u32, u32),
    size: &SizeSettings,
    percent: i64,
    output: &Path,
) -> ProcessResult<ProcessInvocation> {
    let (src_w, src_h) = source_size;
    let (out_w, out_h) = size.output_size(src_w, src_h);

    let mut builder = marked(tools, "Crop and Resize", percent)
        .arg(input)
        .arg("-resize")
        .arg(format!("{}x{}!", src_w, src_h))
        .args(["+repage", "-strip"]);

    if size.crop_enabled && size.crop_width > 0 && size.crop_height > 0 {
        builder = builder
            .args(["+repage", "-crop"])
            .arg(format!(
                "{}x{}+{}+{}",
                size.crop_width, size.crop_height, size.crop_x, size.crop_y
            ))
            .arg("+repage");
    }

    builder
        .arg("-resize")
        .arg(format!("{}x{}!", out_w, out_h))
        .arg(output)
        .build()
}

/// Border thickness in pixels, 0 when disabled.
pub fn border_thickness(effects: &EffectsSettings) -> i32 {
    if effects.border {
        rescale(effects.border_amount as f64, (0.0, 100.0), (1.0, 40.0)) as i32
    } else {
        0
    }
}

/// Escape caption text for `-annotate`.
fn escape_caption(text: &str) -> String {
    text.replace("[enter]", "\n")
        .replace('\\', "\\\\")
        .replace('@', "\\@")
}

fn caption_args(caption: &CaptionSettings, border: i32) -> Vec<String> {
    let gravity = caption.position.gravity();
    let mut adj_x = 0;
    let mut adj_y = 0;
    if gravity.contains("West") || gravity.contains("East") {
        adj_x += CAPTION_MARGIN + border;
    }
    if gravity.contains("North") || gravity.contains("South") {
        adj_y += CAPTION_MARGIN + border;
    }

    let text = escape_caption(&caption.text);
    let mut outline = caption.outline_thickness as i32;
    if outline >= 1 && caption.size > 13 {
        outline += 1;
    }

    let mut args: Vec<String> = vec![
        "(".into(),
        "+clone".into(),
        "-alpha".into(),
        "transparent".into(),
        "-font".into(),
        caption.font.clone(),
        "-pointsize".into(),
        caption.size.to_string(),
        "-gravity".into(),
        gravity.into(),
    ];

    if caption.interline_spacing != 0 {
        args.push("-interline-spacing".into());
        args.push(caption.interline_spacing.to_string());
    }

    if outline >= 1 {
        let tweak_y = if gravity.contains("South") { 1 } else { -1 };
        let tweak_x = if gravity.contains("East") { 1 } else { -1 };
        for (dx, dy) in [(tweak_x, 0), (0, tweak_y)] {
            args.extend([
                "-stroke".into(),
                caption.outline_color.clone(),
                "-strokewidth".into(),
                outline.to_string(),
                "-annotate".into(),
                format!("{:+}{:+}", adj_x + dx, adj_y + dy),
                text.clone(),
            ]);
        }
    }

    args.extend([
        "-stroke".into(),
        "none".into(),
        "-strokewidth".into(),
        outline.max(0).to_string(),
        "-fill".into(),
        caption.color.clone(),
        "-annotate".into(),
        format!("{:+}{:+}", adj_x, adj_y),
        text,
    ]);

    if caption.drop_shadow {
        args.extend(
            [
                "(", "+clone", "-gravity", "none", "-background", "none", "-shadow",
                "60x1-5-5", ")", "+swap", "-compose", "over", "-composite",
            ]
            .map(String::from),
        );
    }

    args.extend([
        ")".into(),
        "-compose".into(),
        "dissolve".into(),
        "-define".into(),
        format!("compose:args={}", caption.opacity),
        "-composite".into(),
    ]);

    args
}

fn captions_for(
    effects: &EffectsSettings,
    frame_index: u32,
    before_effects: bool,
    border: i32,
) -> Vec<String> {
    effects
        .captions
        .iter()
        .filter(|c| c.apply_effects == before_effects)
        .filter(|c| c.shows_on(frame_index) && c.opacity > 1)
        .flat_map(|c| caption_args(c, border))
        .collect()
}

/// Effects chain for one frame, without input and output.
pub fn effect_args(effects: &EffectsSettings, frame_index: u32, palette: bool) -> Vec<String> {
    let border = border_thickness(effects);
    let mut args = captions_for(effects, frame_index, true, border);

    if effects.brightness != 0 || effects.contrast != 0 {
        args.push("-brightness-contrast".into());
        args.push(format!("{}x{}", effects.brightness, effects.contrast));
    }

    if effects.sharpen {
        args.extend(["-sharpen".into(), "3".into()]);
    }

    if effects.saturation != 0 {
        let scaled = 100.0 + rescale(effects.saturation as f64, (-100.0, 100.0), (-80.0, 80.0));
        args.push("-modulate".into());
        args.push(format!("100,{}", scaled as i32));
    }

    if effects.sepia {
        let scaled = rescale(effects.sepia_amount as f64, (0.0, 100.0), (75.0, 100.0));
        args.push("-sepia-tone".into());
        args.push(format!("{}%", scaled as i32));
    }

    if effects.tint {
        let scaled = rescale(effects.tint_amount as f64, (0.0, 100.0), (30.0, 100.0));
        args.extend([
            "-fill".into(),
            effects.tint_color.clone(),
            "-tint".into(),
            (scaled as i32).to_string(),
        ]);
    }

    if effects.fade_edges {
        let inverse = 100.0 - effects.fade_edge_amount.min(100) as f64;
        let radius = rescale(inverse, (0.0, 100.0), (20.0, 60.0)) as i32;
        let sigma = rescale(inverse, (0.0, 100.0), (50.0, 5000.0)) as i32;
        args.extend([
            "-background".into(),
            "black".into(),
            "-vignette".into(),
            format!("{}x{}-30-30", radius, sigma),
        ]);
    }

    if effects.blur > 0 {
        let sigma = rescale(effects.blur as f64, (0.0, 100.0), (1.0, 11.0)) as i32;
        args.push("-blur".into());
        args.push(format!("0x{}", sigma));
    }

    if border > 0 {
        args.extend([
            "-bordercolor".into(),
            effects.border_color.clone(),
            "-border".into(),
            border.to_string(),
        ]);
    }

    if effects.sharpen {
        let amount = effects.sharpen_amount;
        let scaled = rescale(amount as f64, (0.0, 100.0), (0.0, 5.0)) as i32;
        args.push("-sharpen".into());
        args.push(scaled.to_string());
        let dither: [&str; 2] = if amount >= 60 {
            ["-dither", "FloydSteinberg"]
        } else if amount >= 30 {
            ["-dither", "Riemersma"]
        } else {
            ["-ordered-dither", "checks,20"]
        };
        args.extend(dither.map(String::from));
    } else {
        args.extend(["-dither".into(), "none".into()]);
    }

    args.extend(captions_for(effects, frame_index, false, border));

    if effects.grayscale {
        args.extend(["-colorspace".into(), "Gray".into()]);
    }

    if palette {
        args.extend([
            "-depth".into(),
            "8".into(),
            "-colors".into(),
            effects.num_colors.to_string(),
        ]);
    }

    args.extend(["-format".into(), "png".into()]);
    args
}

/// Apply the effects chain to one frame.
///
/// `palette` reduces to `num_colors` for GIF output.
pub fn apply_effects(
    tools: &ToolPaths,
    input: &Path,
    effects: &EffectsSettings,
    frame_index: u32,
    palette: bool,
    percent: i64,
    output: &Path,
) -> ProcessResult<ProcessInvocation> {
    marked(tools, "Applying Filters, Effects and Captions", percent)
        .arg(input)
        .args(effect_args(effects, frame_index, palette))
        .arg(output)
        .build()
}

/// Assemble frames matching `frames_glob` into a GIF.
///
/// The glob is expanded by ImageMagick, not a shell.
pub fn assemble_gif(
    tools: &ToolPaths,
    frames_glob: &Path,
    delay: u32,
    loops: u32,
    output: &Path,
) -> ProcessResult<ProcessInvocation> {
    ProcessInvocation::builder(&tools.convert)
        .label("Generate GIF")
        .arg("-delay")
        .arg(delay.to_string())
        .arg("-loop")
        .arg(loops.to_string())
        .args(["-layers", "optimizePlus"])
        .arg(frames_glob)
        .arg(output)
        .build()
}

/// Rewrite individual frame delays of an existing GIF in place.
pub fn retime_gif(
    tools: &ToolPaths,
    gif: &Path,
    timings: &[FrameTiming],
) -> ProcessResult<ProcessInvocation> {
    let mut builder = ProcessInvocation::builder(&tools.convert)
        .label("Frame timing")
        .arg(gif);

    for timing in timings {
        builder = builder
            .args(["(", "-clone"])
            .arg(timing.index.to_string())
            .args(["-set", "delay"])
            .arg((timing.delay_ms / 10).to_string())
            .args([")", "-swap"])
            .arg(format!("{},-1", timing.index))
            .arg("+delete");
    }

    builder.arg(gif).build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CaptionPosition;

    fn args(inv: &ProcessInvocation) -> Vec<String> {
        inv.args()
            .iter()
            .map(|a| a.to_string_lossy().to_string())
            .collect()
    }

    #[test]
    fn rotate_writes_back_to_the_same_file() {
        let tools = ToolPaths::default();
        let inv = rotate(&tools, Path::new("frame0001.png"), -90, 50).unwrap();
        let a = args(&inv);
        assert_eq!(a.first().map(String::as_str), Some("-comment"));
        let pos = a.iter().position(|x| x == "-rotate").unwrap();
        assert_eq!(a[pos + 1], "-90");
        assert!(a.contains(&"remove".to_string()));
        assert_eq!(inv.output_arg().unwrap(), "frame0001.png");
    }

    #[test]
    fn import_letterboxes_or_stretches() {
        let tools = ToolPaths::default();
        let keep = import_frame(&tools, Path::new("a.png"), 320, 240, true, 0, Path::new("o.png"))
            .unwrap();
        let a = args(&keep);
        assert!(a.contains(&"-extent".to_string()));
        assert!(a.contains(&"320x240".to_string()));

        let stretch =
            import_frame(&tools, Path::new("a.png"), 320, 240, false, 0, Path::new("o.png"))
                .unwrap();
        assert!(args(&stretch).contains(&"320x240!".to_string()));
    }

    #[test]
    fn dissolve_overwrites_first_frame() {
        let inv = dissolve(
            &ToolPaths::default(),
            Path::new("d/image0008.png"),
            Path::new("d/image0010.png"),
            33,
            0,
        )
        .unwrap();
        let a = args(&inv);
        assert_eq!(a.last().unwrap(), "d/image0008.png");
        assert!(a.contains(&"compose:args=33".to_string()));
        assert!(inv.command_line().contains("\"Creating cross-fade:0\""));
    }

    #[test]
    fn crop_is_applied_before_final_resize() {
        let size = SizeSettings {
            crop_enabled: true,
            crop_x: 10,
            crop_y: 20,
            crop_width: 100,
            crop_height: 50,
            output_width: 200,
            output_height: 0,
        };
        let inv = crop_resize(
            &ToolPaths::default(),
            Path::new("in.png"),
            (640, 480),
            &size,
            10,
            Path::new("out.png"),
        )
        .unwrap();
        let a = args(&inv);
        let crop = a.iter().position(|s| s == "100x50+10+20").unwrap();
        let last_resize = a.iter().rposition(|s| s == "-resize").unwrap();
        assert!(crop < last_resize);
        assert_eq!(a[last_resize + 1], "200x100!");
    }

    #[test]
    fn default_effects_only_disable_dither() {
        let a = effect_args(&EffectsSettings::default(), 1, false);
        assert_eq!(a, vec!["-dither", "none", "-format", "png"]);
    }

    #[test]
    fn palette_only_for_gif() {
        let a = effect_args(&EffectsSettings::default(), 1, true);
        assert!(a.windows(2).any(|w| w == ["-colors", "256"]));
    }

    #[test]
    fn captions_respect_frame_range() {
        let mut effects = EffectsSettings::default();
        let mut caption = CaptionSettings::new("hi@there");
        caption.frame_start = 2;
        caption.frame_end = 3;
        caption.position = CaptionPosition::BottomRight;
        effects.captions.push(caption);

        assert!(!effect_args(&effects, 1, false).contains(&"-annotate".to_string()));

        let a = effect_args(&effects, 2, false);
        assert!(a.contains(&"hi\\@there".to_string()));
        assert!(a.contains(&"SouthEast".to_string()));
        assert!(a.contains(&"+3+3".to_string()));
    }

    #[test]
    fn retime_swaps_each_frame() {
        let inv = retime_gif(
            &ToolPaths::default(),
            Path::new("a.gif"),
            &[FrameTiming {
                index: 2,
                delay_ms: 500,
            }],
        )
        .unwrap();
        let a = args(&inv);
        assert_eq!(
            a,
            vec!["a.gif", "(", "-clone", "2", "-set", "delay", "50", ")", "-swap", "2,-1", "+delete", "a.gif"]
        );
    }
}
