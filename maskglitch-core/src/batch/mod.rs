//! batch — one file end to end, and a worker pool over a directory
//!
//! Files are independent: each job gets its own detector, pipeline state and
//! RNG, and only borrows the shared `Resources`. A failing file is reported
//! and never takes its siblings down with it.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use rayon::prelude::*;
use tracing::{error, info, warn};

use crate::detection::LandmarkDetector;
use crate::error::Error;
use crate::mask::Resources;
use crate::mux::{self, MuxOutcome};
use crate::pipeline::VideoPipeline;
use crate::video;

/// Extensions picked up from an input directory (compared lowercase).
pub const VIDEO_EXTENSIONS: [&str; 4] = ["mp4", "mov", "avi", "mkv"];

/// Where one input's intermediate and final outputs go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPaths {
    pub video_only: PathBuf,
    pub output: PathBuf,
}

impl OutputPaths {
    /// `<output_dir>/<stem>_no_audio.mp4` and `<output_dir>/<stem>_final.mp4`.
    pub fn for_input(input: &Path, output_dir: &Path) -> Self {
        Self::named(output_dir, &file_stem(input))
    }

    fn named(output_dir: &Path, name: &str) -> Self {
        Self {
            video_only: output_dir.join(format!("{name}_no_audio.mp4")),
            output: output_dir.join(format!("{name}_final.mp4")),
        }
    }

    /// Output paths for a whole batch, distinct per input.
    ///
    /// Inputs sharing a stem (`clip.mp4`, `clip.mov`) keep their extension in
    /// the name (`clip_mp4`, `clip_mov`); anything still clashing, compared
    /// case-insensitively, gets a numeric suffix.
    pub fn for_batch(inputs: &[PathBuf], output_dir: &Path) -> Vec<Self> {
        let mut stem_counts: HashMap<String, usize> = HashMap::new();
        for input in inputs {
            *stem_counts.entry(file_stem(input).to_lowercase()).or_default() += 1;
        }

        let mut used = HashSet::new();
        inputs
            .iter()
            .map(|input| {
                let stem = file_stem(input);
                let base = match input.extension() {
                    Some(ext) if stem_counts[&stem.to_lowercase()] > 1 => {
                        format!("{stem}_{}", ext.to_string_lossy().to_lowercase())
                    }
                    _ => stem,
                };
                let mut name = base.clone();
                let mut n = 2;
                while !used.insert(name.to_lowercase()) {
                    name = format!("{base}_{n}");
                    n += 1;
                }
                Self::named(output_dir, &name)
            })
            .collect()
    }
}

fn file_stem(input: &Path) -> String {
    input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "video".to_string())
}

/// Result of a successfully processed file.
#[derive(Debug, Clone)]
pub struct FileReport {
    pub output: PathBuf,
    pub frames: u64,
    pub width: u32,
    pub height: u32,
    pub mux: MuxOutcome,
    pub elapsed: Duration,
}

/// Per-file entry of a batch run.
#[derive(Debug)]
pub struct JobReport {
    pub input: PathBuf,
    pub result: Result<FileReport>,
}

#[derive(Debug, Clone, Copy)]
pub struct BatchOptions {
    /// Worker threads; each processes one file at a time.
    pub jobs: usize,
    /// Put the source audio back. When false the video-only output is
    /// simply renamed into place.
    pub remux_audio: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            jobs: default_jobs(),
            remux_audio: true,
        }
    }
}

/// All cores but one, at least one.
pub fn default_jobs() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}

/// Run one video through the pipeline into `paths.output`.
///
/// `progress_fn(current, total)` is called after every frame; `total` is the
/// container's frame-count estimate (0 if unknown).
pub fn process_file<D: LandmarkDetector>(
    resources: &Resources,
    detector: D,
    input: &Path,
    paths: &OutputPaths,
    remux_audio: bool,
    mut progress_fn: impl FnMut(u64, u64),
) -> Result<FileReport> {
    let start = Instant::now();
    info!(input = %input.display(), output = %paths.output.display(), "processing video");

    let total = video::total_frames(input);
    let mut pipeline = VideoPipeline::new(resources, detector);
    let assembled = video::assemble_with_progress(
        input,
        &paths.video_only,
        total,
        |frame| pipeline.process(frame).map(|_| ()),
        &mut progress_fn,
    );
    let stats = match assembled {
        Ok(stats) => stats,
        Err(e) => {
            if paths.video_only.exists() {
                if let Err(rm) = fs::remove_file(&paths.video_only) {
                    warn!(path = %paths.video_only.display(), "failed to remove partial video: {rm}");
                }
            }
            return Err(e);
        }
    };

    let mux = if remux_audio {
        mux::remux_audio(&paths.video_only, input, &paths.output)?
    } else {
        mux::pass_through(&paths.video_only, &paths.output)?
    };

    let elapsed = start.elapsed();
    info!(
        input = %input.display(),
        frames = stats.frames,
        elapsed_s = format!("{:.1}", elapsed.as_secs_f64()),
        "video done"
    );
    Ok(FileReport {
        output: paths.output.clone(),
        frames: stats.frames,
        width: stats.width,
        height: stats.height,
        mux,
        elapsed,
    })
}

/// Video files directly inside `dir`, sorted by name.
pub fn discover_videos(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        bail!("input directory {} does not exist", dir.display());
    }
    let mut videos = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))? {
        let path = entry?.path();
        let is_video = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .is_some_and(|e| VIDEO_EXTENSIONS.contains(&e.as_str()));
        if is_video && path.is_file() {
            videos.push(path);
        }
    }
    if videos.is_empty() {
        bail!("no videos found in {}", dir.display());
    }
    videos.sort();
    Ok(videos)
}

/// Process every video in `input_dir` into `output_dir` on a pool of
/// `options.jobs` workers. `make_detector` is called once per file.
/// `on_done` sees each report as soon as its file finishes.
///
/// Only discovery and pool setup can fail the whole batch.
pub fn run_batch<D, F, G>(
    resources: &Resources,
    input_dir: &Path,
    output_dir: &Path,
    options: BatchOptions,
    make_detector: F,
    on_done: G,
) -> Result<Vec<JobReport>>
where
    D: LandmarkDetector,
    F: Fn() -> Result<D> + Sync,
    G: Fn(&JobReport) + Sync,
{
    let videos = discover_videos(input_dir)?;
    fs::create_dir_all(output_dir)
        .with_context(|| format!("failed to create {}", output_dir.display()))?;

    let jobs = options.jobs.max(1);
    info!(videos = videos.len(), jobs, "starting batch");
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(jobs)
        .thread_name(|i| format!("maskglitch-worker-{i}"))
        .build()
        .context("failed to build worker pool")?;

    let outputs = OutputPaths::for_batch(&videos, output_dir);
    let reports = pool.install(|| {
        videos
            .par_iter()
            .zip(outputs.par_iter())
            .map(|(input, paths)| {
                let result = make_detector()
                    .with_context(|| format!("{}: failed to create detector", input.display()))
                    .and_then(|detector| {
                        process_file(
                            resources,
                            detector,
                            input,
                            paths,
                            options.remux_audio,
                            |_, _| {},
                        )
                    });
                if let Err(e) = &result {
                    let file = failing_file(e).unwrap_or(input.as_path());
                    error!(input = %input.display(), file = %file.display(), "failed: {e:#}");
                }
                let report = JobReport {
                    input: input.clone(),
                    result,
                };
                on_done(&report);
                report
            })
            .collect::<Vec<_>>()
    });

    let failed = reports.iter().filter(|r| r.result.is_err()).count();
    info!(total = reports.len(), failed, "batch complete");
    Ok(reports)
}

/// The file a failure is attributed to (the source, an intermediate, or the
/// final output), when the error chain carries one.
pub fn failing_file(err: &anyhow::Error) -> Option<&Path> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<Error>())
        .and_then(Error::file)
}
