use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use maskglitch_core::{
    batch::{self, BatchOptions, OutputPaths},
    detection::FaceMeshDetector,
    mux::MuxOutcome,
    runtime::configure_ort_dylib,
    video, Config, Resources,
};

// ── CLI definition ────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "maskglitch",
    version,
    about = "Track a face, pin a mask to it, and glitch the result",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process a single video.
    Run {
        /// Input video path
        #[arg(short, long)]
        input: PathBuf,

        /// Directory for `<name>_final.mp4`
        #[arg(short, long, default_value = "output")]
        output_dir: PathBuf,

        #[command(flatten)]
        common: CommonArgs,
    },

    /// Process every video in a directory on a worker pool.
    Batch {
        /// Directory scanned for .mp4 / .mov / .avi / .mkv files
        #[arg(short, long, default_value = "input")]
        input_dir: PathBuf,

        /// Directory for `<name>_final.mp4` files
        #[arg(short, long, default_value = "output")]
        output_dir: PathBuf,

        /// Worker threads (default: all cores but one)
        #[arg(short, long)]
        jobs: Option<usize>,

        #[command(flatten)]
        common: CommonArgs,
    },
}

#[derive(Args)]
struct CommonArgs {
    /// RGBA mask image
    #[arg(long, default_value = "assets/mask.png")]
    mask: PathBuf,

    /// Mask anchor points (JSON: left_eye, right_eye, chin)
    #[arg(long, default_value = "assets/mask_keypoints.json")]
    keypoints: PathBuf,

    /// Face-mesh ONNX model path
    #[arg(long, default_value = "models/face_mesh.onnx")]
    model: PathBuf,

    /// BlazeFace short-range ONNX model, used to find faces for the mesh
    #[arg(long, default_value = "models/face_detection_short_range.onnx")]
    face_model: PathBuf,

    /// TOML file with any subset of the config keys
    #[arg(long)]
    config: Option<PathBuf>,

    /// Skip the audio remux and keep the processed video silent
    #[arg(long)]
    no_audio: bool,

    #[command(flatten)]
    overrides: ConfigOverrides,
}

/// Per-key overrides, applied on top of defaults and `--config`.
#[derive(Args)]
struct ConfigOverrides {
    #[arg(long)]
    max_width: Option<u32>,
    #[arg(long)]
    frame_skip: Option<u64>,
    #[arg(long)]
    landmark_interval: Option<u64>,
    #[arg(long)]
    glitch_intensity: Option<u32>,
    #[arg(long)]
    noise_level: Option<u16>,
    #[arg(long)]
    max_band_width: Option<u32>,
    #[arg(long)]
    max_shift: Option<u32>,
    #[arg(long)]
    seed: Option<u64>,
}

impl ConfigOverrides {
    fn apply(&self, config: &mut Config) {
        if let Some(v) = self.max_width {
            config.max_width = v;
        }
        if let Some(v) = self.frame_skip {
            config.frame_skip = v;
        }
        if let Some(v) = self.landmark_interval {
            config.landmark_interval = v;
        }
        if let Some(v) = self.glitch_intensity {
            config.glitch_intensity = v;
        }
        if let Some(v) = self.noise_level {
            config.noise_level = v;
        }
        if let Some(v) = self.max_band_width {
            config.max_band_width = v;
        }
        if let Some(v) = self.max_shift {
            config.max_shift = v;
        }
        if let Some(v) = self.seed {
            config.seed = v;
        }
    }
}

impl CommonArgs {
    /// Config plus mask, validated. Any failure here aborts the whole run.
    fn load_resources(&self) -> Result<Resources> {
        let mut config = match &self.config {
            Some(path) => Config::from_toml_file(path)?,
            None => Config::default(),
        };
        self.overrides.apply(&mut config);

        let resources = Resources::load(config, &self.mask, &self.keypoints)
            .context("failed to load mask resources")?;
        info!(config = ?resources.config, "configuration");

        for model in [&self.model, &self.face_model] {
            if !model.is_file() {
                bail!("model not found: {}", model.display());
            }
        }
        configure_ort_dylib();
        Ok(resources)
    }

    fn load_detector(&self, max_faces: u32) -> Result<FaceMeshDetector> {
        FaceMeshDetector::load(&self.model, &self.face_model, max_faces).with_context(|| {
            format!(
                "failed to load models: {}, {}",
                self.model.display(),
                self.face_model.display()
            )
        })
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    // Respect RUST_LOG; default to info
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            input,
            output_dir,
            common,
        } => cmd_run(&input, &output_dir, &common),
        Commands::Batch {
            input_dir,
            output_dir,
            jobs,
            common,
        } => cmd_batch(&input_dir, &output_dir, jobs, &common),
    }
}

// ── Single file ───────────────────────────────────────────────────────────────

fn cmd_run(input: &Path, output_dir: &Path, common: &CommonArgs) -> Result<()> {
    let resources = common.load_resources()?;
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("failed to create {}", output_dir.display()))?;

    let detector = common.load_detector(resources.config.max_faces)?;

    let paths = OutputPaths::for_input(input, output_dir);
    info!("  input  : {}", input.display());
    info!("  output : {}", paths.output.display());

    let total = video::total_frames(input);
    let pb = if total > 0 {
        frame_bar(total)?
    } else {
        spinner("Processing…")?
    };
    let pb2 = pb.clone();

    let report = batch::process_file(
        &resources,
        detector,
        input,
        &paths,
        !common.no_audio,
        move |current, _| pb2.set_position(current),
    )
    .with_context(|| format!("failed to process {}", input.display()))?;

    pb.finish_with_message("Done.");
    info!(
        frames = report.frames,
        width = report.width,
        height = report.height,
        audio = report.mux == MuxOutcome::Muxed,
        "saved {} in {:.1}s",
        report.output.display(),
        report.elapsed.as_secs_f64()
    );
    Ok(())
}

// ── Batch ─────────────────────────────────────────────────────────────────────

fn cmd_batch(
    input_dir: &Path,
    output_dir: &Path,
    jobs: Option<usize>,
    common: &CommonArgs,
) -> Result<()> {
    let resources = common.load_resources()?;
    let count = batch::discover_videos(input_dir)?.len() as u64;

    let options = BatchOptions {
        jobs: jobs.unwrap_or_else(batch::default_jobs),
        remux_audio: !common.no_audio,
    };
    let max_faces = resources.config.max_faces;
    let pb = file_bar(count)?;

    let reports = batch::run_batch(
        &resources,
        input_dir,
        output_dir,
        options,
        || common.load_detector(max_faces),
        |report| {
            if let Some(name) = report.input.file_name() {
                pb.set_message(name.to_string_lossy().into_owned());
            }
            pb.inc(1);
        },
    )?;
    pb.finish_with_message("Batch complete.");

    let failed: Vec<_> = reports.iter().filter(|r| r.result.is_err()).collect();
    for report in &failed {
        if let Err(e) = &report.result {
            warn!("{}: {e:#}", report.input.display());
        }
    }
    info!(
        succeeded = reports.len() - failed.len(),
        failed = failed.len(),
        "all videos processed"
    );
    if !failed.is_empty() {
        bail!("{} of {} videos failed", failed.len(), reports.len());
    }
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn spinner(msg: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg} [{elapsed_precise}] {pos} frames")?
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    Ok(pb)
}

fn frame_bar(total: u64) -> Result<ProgressBar> {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::with_template(
            "{bar:40.cyan/blue} {pos}/{len} frames [{elapsed_precise} < {eta}] {msg}",
        )?
        .progress_chars("█▉▊▋▌▍▎▏ "),
    );
    Ok(pb)
}

fn file_bar(total: u64) -> Result<ProgressBar> {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::with_template("{bar:40.green/white} {pos}/{len} videos [{elapsed_precise}] {msg}")?,
    );
    pb.enable_steady_tick(Duration::from_millis(200));
    Ok(pb)
}
