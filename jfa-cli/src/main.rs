//! Lloyd relaxation CLI
//!
//! Scatters seeded random sites over a grid, then alternates jump flooding
//! and centroid reduction until the sites stop moving (or the iteration
//! budget runs out). The result is written as a PNG of the final
//! tessellation, or as a GIF/MP4 with one frame per iteration.
//!
//! ## YAML run file
//!
//! ```yaml
//! width: 512
//! height: 512
//! sites: 400
//! seed: 7
//! iterations: 80
//! threshold: 0.0001
//! extra_passes: 1
//! borders: true
//! ```
//!
//! Run with: `jfa-lloyd -o out.gif --config run.yaml --sites 1000`
//!
//! Flags given on the command line win over values from the run file.
//!
//! ## Graceful interruption
//!
//! Press Ctrl+C to stop relaxing early; the output is still written from the
//! iterations completed so far.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::{ArgAction, Parser, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info};
use serde::Deserialize;

use jfa_core::{
    render, AssignmentGrid, CpuDispatch, GridShape, JfaConfig, JfaEngine, ReductionConfig,
    ReductionEngine, RenderStyle, SiteStore,
};

#[cfg(feature = "gpu")]
use jfa_core::{GpuAllocator, GpuContext, GpuJfa, SiteMirror};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
enum OutputFormat {
    Png,
    Gif,
    Mp4,
}

impl OutputFormat {
    fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()?.to_ascii_lowercase().as_str() {
            "png" => Some(OutputFormat::Png),
            "gif" => Some(OutputFormat::Gif),
            "mp4" => Some(OutputFormat::Mp4),
            _ => None,
        }
    }
}

/// YAML run file; every field is optional
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RunFile {
    width: Option<i64>,
    height: Option<i64>,
    sites: Option<usize>,
    seed: Option<u64>,
    iterations: Option<u32>,
    threshold: Option<f64>,
    extra_passes: Option<usize>,
    patches_per_line: Option<u32>,
    input: Option<PathBuf>,
    format: Option<OutputFormat>,
    fps: Option<u32>,
    show_sites: Option<bool>,
    borders: Option<bool>,
    line_width: Option<u32>,
}

fn load_run_file(path: &PathBuf) -> anyhow::Result<RunFile> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read run file: {:?}", path))?;
    serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse run file: {:?}", path))
}

#[derive(Parser, Debug)]
#[command(name = "jfa-lloyd")]
#[command(about = "Relax random sites into a centroidal Voronoi tessellation", long_about = None)]
#[command(arg_required_else_help = true)]
struct Args {
    /// Output file path (.png, .gif or .mp4)
    #[arg(short, long)]
    output: PathBuf,

    /// Output format (defaults to the output file's extension)
    #[arg(short, long, value_enum)]
    format: Option<OutputFormat>,

    /// YAML run file; explicit flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Image whose colors are averaged over each cell
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Grid width in cells (defaults to the input image width, else 512)
    #[arg(long, allow_negative_numbers = true)]
    width: Option<i64>,

    /// Grid height in cells (defaults to the input image height, else 512)
    #[arg(long, allow_negative_numbers = true)]
    height: Option<i64>,

    /// Number of sites
    #[arg(short, long)]
    sites: Option<usize>,

    /// Random seed for reproducibility
    #[arg(long)]
    seed: Option<u64>,

    /// Maximum number of Lloyd iterations
    #[arg(short = 'n', long)]
    iterations: Option<u32>,

    /// Stop once no site moves farther than this (normalized units)
    #[arg(short, long, allow_negative_numbers = true)]
    threshold: Option<f64>,

    /// Extra step-1 passes after the standard flood (JFA+N)
    #[arg(long)]
    extra_passes: Option<usize>,

    /// Reduction patches along one side of a grid quadrant
    #[arg(long)]
    patches_per_line: Option<u32>,

    /// Frames per second for animated output
    #[arg(long)]
    fps: Option<u32>,

    /// Draw site positions as dots
    #[arg(long)]
    show_sites: bool,

    /// Draw cell borders
    #[arg(long)]
    borders: bool,

    /// Border thickness and dot radius in cells
    #[arg(long)]
    line_width: Option<u32>,

    /// Run kernels on one thread
    #[arg(long)]
    serial: bool,

    /// Use GPU jump flooding (if available)
    #[arg(long)]
    gpu: bool,

    /// Raise log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

/// Fully resolved run parameters
#[derive(Debug, Clone, PartialEq)]
struct Settings {
    width: Option<u32>,
    height: Option<u32>,
    sites: usize,
    seed: u64,
    iterations: u32,
    threshold: f64,
    jfa: JfaConfig,
    reduction: ReductionConfig,
    input: Option<PathBuf>,
    format: OutputFormat,
    fps: u32,
    style: RenderStyle,
}

impl Settings {
    /// Merge flags over the run file over built-in defaults.
    fn resolve(args: &Args, run_file: RunFile) -> anyhow::Result<Self> {
        let width = args.width.or(run_file.width);
        let height = args.height.or(run_file.height);
        if width.is_some() || height.is_some() {
            // rejects zero and negative sides; a missing side is checked later
            GridShape::from_signed(width.unwrap_or(1), height.unwrap_or(1))?;
        }

        let iterations = args.iterations.or(run_file.iterations).unwrap_or(50);
        if iterations == 0 {
            anyhow::bail!("iterations must be at least 1");
        }
        let threshold = args.threshold.or(run_file.threshold).unwrap_or(1e-4);
        if !(threshold >= 0.0) {
            anyhow::bail!("threshold must be a non-negative number, got {}", threshold);
        }
        let reduction = ReductionConfig {
            patches_per_line: args.patches_per_line.or(run_file.patches_per_line).unwrap_or(3),
        };
        reduction.patch_count()?;

        let format = match args.format.or(run_file.format) {
            Some(format) => format,
            None => OutputFormat::from_path(&args.output).ok_or_else(|| {
                anyhow::anyhow!("cannot infer format from {:?}; pass --format", args.output)
            })?,
        };

        Ok(Self {
            width: width.map(|w| w as u32),
            height: height.map(|h| h as u32),
            sites: args.sites.or(run_file.sites).unwrap_or(256),
            seed: args.seed.or(run_file.seed).unwrap_or(0),
            iterations,
            threshold,
            jfa: JfaConfig {
                extra_passes: args.extra_passes.or(run_file.extra_passes).unwrap_or(0),
            },
            reduction,
            input: args.input.clone().or(run_file.input),
            format,
            fps: args.fps.or(run_file.fps).unwrap_or(10).max(1),
            style: RenderStyle {
                draw_sites: args.show_sites || run_file.show_sites.unwrap_or(false),
                draw_borders: args.borders || run_file.borders.unwrap_or(false),
                line_width: args.line_width.or(run_file.line_width).unwrap_or(1),
            },
        })
    }

    /// Grid size from the explicit sides, filling a missing side from the
    /// input image's aspect ratio (or 512 without an image).
    fn grid_shape(&self, image_dims: Option<(u32, u32)>) -> anyhow::Result<GridShape> {
        let (w, h) = match (self.width, self.height, image_dims) {
            (Some(w), Some(h), _) => (w, h),
            (Some(w), None, Some((iw, ih))) => (w, (ih as f64 * w as f64 / iw as f64).round() as u32),
            (None, Some(h), Some((iw, ih))) => ((iw as f64 * h as f64 / ih as f64).round() as u32, h),
            (None, None, Some(dims)) => dims,
            (w, h, None) => (w.unwrap_or(512), h.unwrap_or(512)),
        };
        Ok(GridShape::new(w.max(1), h.max(1))?)
    }
}

/// Where jump flooding runs
enum Tessellator {
    Cpu(JfaEngine),
    #[cfg(feature = "gpu")]
    Gpu {
        jfa: GpuJfa,
        mirror: SiteMirror<GpuAllocator>,
    },
}

impl Tessellator {
    fn new(
        settings: &Settings,
        dispatch: CpuDispatch,
        gpu: bool,
        #[cfg_attr(not(feature = "gpu"), allow(unused_variables))] site_hint: usize,
    ) -> Self {
        let cpu = || Tessellator::Cpu(JfaEngine::with_config(dispatch, settings.jfa));

        #[cfg(feature = "gpu")]
        if gpu {
            let setup = GpuContext::new().and_then(|ctx| {
                let jfa = GpuJfa::with_config(ctx.clone(), settings.jfa)?;
                let mirror = SiteMirror::new(GpuAllocator::new(ctx), site_hint)?;
                Ok(Tessellator::Gpu { jfa, mirror })
            });
            return match setup {
                Ok(gpu) => {
                    println!("Using GPU jump flooding (wgpu)");
                    gpu
                }
                Err(e) => {
                    eprintln!("Warning: GPU initialization failed: {}. Falling back to CPU.", e);
                    cpu()
                }
            };
        }

        #[cfg(not(feature = "gpu"))]
        if gpu {
            eprintln!("Warning: GPU feature not enabled. Using CPU jump flooding.");
        }
        cpu()
    }

    fn run(&mut self, store: &mut SiteStore, shape: GridShape) -> anyhow::Result<AssignmentGrid> {
        match self {
            Tessellator::Cpu(engine) => {
                // the host reads the store directly, nothing to upload
                store.flush();
                Ok(engine.run(store.sites(), shape.width, shape.height)?)
            }
            #[cfg(feature = "gpu")]
            Tessellator::Gpu { jfa, mirror } => {
                if let Some(range) = mirror.sync(store)? {
                    debug!("uploaded sites [{}, {})", range.lo, range.hi);
                }
                Ok(jfa.run(mirror, shape.width, shape.height)?)
            }
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    // Set up SIGINT handler
    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = interrupted.clone();
        ctrlc::set_handler(move || {
            interrupted.store(true, Ordering::SeqCst);
        })
        .context("failed to set Ctrl-C handler")?;
    }

    let run_file = args.config.as_ref().map(load_run_file).transpose()?.unwrap_or_default();
    let settings = Settings::resolve(&args, run_file)?;
    debug!("settings: {:?}", settings);

    let source = settings
        .input
        .as_ref()
        .map(|path| {
            println!("Loading image: {:?}", path);
            image::open(path)
                .with_context(|| format!("failed to open input image: {:?}", path))
                .map(|img| img.to_rgb8())
        })
        .transpose()?;
    let shape = settings.grid_shape(source.as_ref().map(|img| img.dimensions()))?;
    let source = source.map(|img| {
        if img.dimensions() == (shape.width, shape.height) {
            img
        } else {
            println!(
                "Resizing {}x{} -> {}x{}",
                img.width(),
                img.height(),
                shape.width,
                shape.height
            );
            image::imageops::resize(&img, shape.width, shape.height, image::imageops::FilterType::Lanczos3)
        }
    });
    println!("Grid size: {}x{}", shape.width, shape.height);

    let dispatch = if args.serial {
        CpuDispatch::serial()
    } else {
        CpuDispatch::new()
    };
    let mut tessellator = Tessellator::new(&settings, dispatch, args.gpu, settings.sites);
    let reduction = ReductionEngine::with_config(dispatch, settings.reduction);

    let mut store = SiteStore::random(settings.sites, settings.seed);
    println!("Relaxing {} sites (seed: {})", settings.sites, settings.seed);

    // Set up progress bar
    let progress = ProgressBar::new(settings.iterations as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")?
            .progress_chars("#>-"),
    );

    let mut encoder = FrameEncoder::open(&args.output, settings.format, shape, settings.fps)?;

    let start = Instant::now();
    let mut iterations_run = 0;
    let mut converged = false;
    while iterations_run < settings.iterations {
        if interrupted.load(Ordering::Relaxed) {
            progress.abandon_with_message("Interrupted");
            eprintln!(
                "Interrupted after {} of {} iterations, writing output...",
                iterations_run, settings.iterations
            );
            break;
        }

        let grid = tessellator.run(&mut store, shape)?;
        if let Some(encoder) = encoder.as_mut() {
            let frame = render(&grid, store.sites(), &settings.style);
            encoder.write_frame(&frame)?;
        }

        let step = match &source {
            Some(image) => reduction.relax_sampled(&grid, store.sites(), image)?,
            None => reduction.relax(&grid, store.sites())?,
        };
        iterations_run += 1;
        info!(
            "iteration {}: max displacement {:.6}, {} empty cells",
            iterations_run,
            step.max_displacement,
            grid.unclaimed_cells()
        );
        progress.set_message(format!("max move {:.2e}", step.max_displacement));
        progress.inc(1);

        let max_displacement = step.max_displacement;
        store.replace_all(step.sites);
        if max_displacement < settings.threshold {
            converged = true;
            break;
        }
    }

    if !interrupted.load(Ordering::Relaxed) {
        progress.finish_with_message(if converged { "Converged" } else { "Budget spent" });
    }

    // final tessellation of the relaxed sites
    let grid = tessellator.run(&mut store, shape)?;
    let frame = render(&grid, store.sites(), &settings.style);
    match encoder {
        Some(mut encoder) => {
            encoder.write_frame(&frame)?;
            encoder.finish()?;
        }
        None => frame
            .save(&args.output)
            .with_context(|| format!("failed to write {:?}", args.output))?,
    }

    let status = if converged { "converged" } else { "not converged" };
    println!(
        "Output saved to: {:?} ({} iterations, {})",
        args.output, iterations_run, status
    );
    println!("Relax time: {:.1}s wall", start.elapsed().as_secs_f64());
    Ok(())
}

/// Animation output: every relaxation step becomes one frame.
enum FrameEncoder {
    /// Raw RGB piped into an ffmpeg child process
    Mp4(std::process::Child),
    Gif {
        encoder: gif::Encoder<std::fs::File>,
        size: (u16, u16),
        delay: u16,
    },
}

impl FrameEncoder {
    /// Open a stream for `format`, or `None` when the format is a single image.
    fn open(
        output: &Path,
        format: OutputFormat,
        shape: GridShape,
        fps: u32,
    ) -> anyhow::Result<Option<Self>> {
        let encoder = match format {
            OutputFormat::Png => return Ok(None),
            OutputFormat::Mp4 => {
                use std::process::{Command, Stdio};
                let child = Command::new("ffmpeg")
                    .args(ffmpeg_args(output, shape, fps)?)
                    .stdin(Stdio::piped())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .spawn()
                    .context("failed to spawn ffmpeg")?;
                FrameEncoder::Mp4(child)
            }
            OutputFormat::Gif => {
                let width = u16::try_from(shape.width);
                let height = u16::try_from(shape.height);
                let (Ok(width), Ok(height)) = (width, height) else {
                    anyhow::bail!(
                        "GIF frames are limited to 65535x65535, got {}x{}",
                        shape.width,
                        shape.height
                    );
                };
                let file = std::fs::File::create(output)
                    .with_context(|| format!("failed to create {:?}", output))?;
                let mut encoder = gif::Encoder::new(file, width, height, &[])?;
                encoder.set_repeat(gif::Repeat::Infinite)?;
                FrameEncoder::Gif {
                    encoder,
                    size: (width, height),
                    delay: (100 / fps).max(1) as u16,
                }
            }
        };
        Ok(Some(encoder))
    }

    fn write_frame(&mut self, frame: &image::RgbImage) -> anyhow::Result<()> {
        match self {
            FrameEncoder::Mp4(child) => {
                use std::io::Write;
                child
                    .stdin
                    .as_mut()
                    .ok_or_else(|| anyhow::anyhow!("ffmpeg stdin closed"))?
                    .write_all(frame.as_raw())
                    .context("failed to write frame to ffmpeg")?;
            }
            FrameEncoder::Gif {
                encoder,
                size: (width, height),
                delay,
            } => {
                let (pixels, palette) = quantize(frame.as_raw());
                let mut gif_frame = gif::Frame::from_palette_pixels(*width, *height, pixels, palette, None);
                gif_frame.delay = *delay;
                encoder.write_frame(&gif_frame)?;
            }
        }
        Ok(())
    }

    fn finish(self) -> anyhow::Result<()> {
        if let FrameEncoder::Mp4(mut child) = self {
            // closing stdin ends the stream
            drop(child.stdin.take());
            let status = child.wait()?;
            if !status.success() {
                anyhow::bail!("ffmpeg exited with {}", status);
            }
        }
        Ok(())
    }
}

/// ffmpeg arguments for an rgb24 stream of `shape`-sized frames
fn ffmpeg_args(output: &Path, shape: GridShape, fps: u32) -> anyhow::Result<Vec<String>> {
    let output = output
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("output path is not valid UTF-8: {:?}", output))?;
    let size = format!("{}x{}", shape.width, shape.height);
    let rate = fps.to_string();
    Ok([
        "-y", "-f", "rawvideo", "-pix_fmt", "rgb24", "-s", &size, "-r", &rate, "-i", "-",
        // x264 needs even sides
        "-vf", "pad=ceil(iw/2)*2:ceil(ih/2)*2",
        "-c:v", "libx264", "-pix_fmt", "yuv420p", "-crf", "18", output,
    ]
    .map(String::from)
    .to_vec())
}

/// Map RGB pixels onto a palette of at most 256 colors. Colors past the
/// first 256 distinct ones snap to their nearest palette entry.
fn quantize(rgb_data: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let mut pixels = Vec::with_capacity(rgb_data.len() / 3);
    let mut palette: Vec<[u8; 3]> = Vec::new();

    for chunk in rgb_data.chunks_exact(3) {
        let rgb = [chunk[0], chunk[1], chunk[2]];
        let idx = palette.iter().position(|&c| c == rgb).unwrap_or_else(|| {
            if palette.len() < 256 {
                palette.push(rgb);
                palette.len() - 1
            } else {
                palette
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, c)| {
                        let dr = c[0] as i32 - rgb[0] as i32;
                        let dg = c[1] as i32 - rgb[1] as i32;
                        let db = c[2] as i32 - rgb[2] as i32;
                        dr * dr + dg * dg + db * db
                    })
                    .map(|(i, _)| i)
                    .unwrap_or(0)
            }
        });
        pixels.push(idx as u8);
    }

    palette.resize(256, [0, 0, 0]);
    (pixels, palette.concat())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["jfa-lloyd", "-o", "out.png"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::resolve(&args(&[]), RunFile::default()).unwrap();
        assert_eq!(settings.format, OutputFormat::Png);
        assert_eq!(settings.sites, 256);
        assert_eq!(settings.iterations, 50);
        assert_eq!(settings.reduction, ReductionConfig::default());
        let shape = settings.grid_shape(None).unwrap();
        assert_eq!((shape.width, shape.height), (512, 512));
    }

    #[test]
    fn test_flags_override_run_file() {
        let run_file: RunFile = serde_yaml::from_str(
            "width: 64\nheight: 32\nsites: 10\nseed: 3\nformat: gif\nborders: true\n",
        )
        .unwrap();
        let settings = Settings::resolve(&args(&["--sites", "20", "--width", "128"]), run_file).unwrap();
        assert_eq!(settings.sites, 20);
        assert_eq!(settings.seed, 3);
        assert_eq!(settings.format, OutputFormat::Gif);
        assert!(settings.style.draw_borders);
        let shape = settings.grid_shape(None).unwrap();
        assert_eq!((shape.width, shape.height), (128, 32));
    }

    #[test]
    fn test_invalid_settings_rejected() {
        assert!(Settings::resolve(&args(&["--width", "-4"]), RunFile::default()).is_err());
        assert!(Settings::resolve(&args(&["--height", "0"]), RunFile::default()).is_err());
        assert!(Settings::resolve(&args(&["--iterations", "0"]), RunFile::default()).is_err());
        assert!(Settings::resolve(&args(&["--threshold", "-1"]), RunFile::default()).is_err());
        assert!(Settings::resolve(&args(&["--patches-per-line", "0"]), RunFile::default()).is_err());
        // 2 * 40000 patches per side overflow the pyramid's patch count
        assert!(Settings::resolve(&args(&["--patches-per-line", "40000"]), RunFile::default()).is_err());
        assert!(Settings::resolve(&args(&["--patches-per-line", "2147483648"]), RunFile::default()).is_err());
    }

    #[test]
    fn test_png_opens_no_stream() {
        let shape = GridShape::new(8, 8).unwrap();
        let encoder = FrameEncoder::open(Path::new("out.png"), OutputFormat::Png, shape, 10).unwrap();
        assert!(encoder.is_none());
    }

    #[test]
    fn test_ffmpeg_args_describe_frames() {
        let shape = GridShape::new(96, 54).unwrap();
        let argv = ffmpeg_args(Path::new("relax.mp4"), shape, 24).unwrap();
        let value_of = |flag: &str| {
            let i = argv.iter().position(|a| a == flag).unwrap();
            argv[i + 1].clone()
        };
        assert_eq!(value_of("-s"), "96x54");
        assert_eq!(value_of("-r"), "24");
        assert_eq!(value_of("-f"), "rawvideo");
        assert_eq!(argv.last().map(String::as_str), Some("relax.mp4"));
    }

    #[test]
    fn test_missing_side_follows_image_aspect() {
        let settings = Settings::resolve(&args(&["--width", "100"]), RunFile::default()).unwrap();
        let shape = settings.grid_shape(Some((400, 200))).unwrap();
        assert_eq!((shape.width, shape.height), (100, 50));
    }

    #[test]
    fn test_quantize_caps_palette() {
        let rgb: Vec<u8> = (0..300u32).flat_map(|i| [i as u8, (i >> 8) as u8, 7]).collect();
        let (pixels, palette) = quantize(&rgb);
        assert_eq!(pixels.len(), 300);
        assert_eq!(palette.len(), 256 * 3);
        assert_eq!(pixels[0], 0);
        assert_eq!(pixels[255], 255);
    }
}
