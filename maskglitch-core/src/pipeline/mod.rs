use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::detection::LandmarkDetector;
use crate::glitch::{GlitchGenerator, RandomStream};
use crate::mask::Resources;
use crate::rendering::composite;
use crate::resize::FrameResizer;
use crate::tracking::{LandmarkSet, LandmarkTracker};
use crate::video::RgbFrame;
use crate::warp::WarpEngine;

/// How often (in frames) averaged stage timings are logged.
const TIMING_LOG_EVERY: u64 = 300;

/// Decision for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameAction {
    /// Run detection → warp → composite → glitch.
    Process,
    /// Re-emit the last processed frame verbatim.
    Reuse,
}

/// Decides which frames get the full treatment.
#[derive(Debug, Clone, Copy)]
pub struct FrameSkip {
    interval: u64,
}

impl FrameSkip {
    pub fn new(interval: u64) -> Self {
        Self {
            interval: interval.max(1),
        }
    }

    /// Frame 0 is always processed; after that every `interval`-th frame.
    /// Without a previous output there is nothing to reuse, so the frame is
    /// processed regardless.
    pub fn action(&self, frame_index: u64, have_previous: bool) -> FrameAction {
        if frame_index == 0 || !have_previous || frame_index % self.interval == 0 {
            FrameAction::Process
        } else {
            FrameAction::Reuse
        }
    }
}

/// What happened to one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FrameOutcome {
    /// Previous output re-emitted.
    Reused,
    /// Fully processed. `landmarks` is what the tracker returned;
    /// `overlaid` is false when there were none or the warp was degenerate,
    /// in which case no glitch was applied either.
    Processed {
        landmarks: Option<LandmarkSet>,
        overlaid: bool,
    },
}

/// All mutable per-video state: landmark cache, last output, RNG cursor.
///
/// One instance per video, fed frames strictly in order. Shared inputs come
/// in through `&Resources`; nothing here is shared with other videos.
pub struct VideoPipeline<'r, D> {
    resources: &'r Resources,
    resizer: FrameResizer,
    skip: FrameSkip,
    tracker: LandmarkTracker<D>,
    warper: WarpEngine,
    glitcher: GlitchGenerator,
    rng: RandomStream,
    last_processed: Option<RgbFrame>,
    frame_index: u64,
    prof: StageTimings,
}

#[derive(Default)]
struct StageTimings {
    processed: u64,
    reused: u64,
    overlaid: u64,
    detect: Duration,
    warp: Duration,
    composite: Duration,
    glitch: Duration,
}

impl<'r, D: LandmarkDetector> VideoPipeline<'r, D> {
    pub fn new(resources: &'r Resources, detector: D) -> Self {
        let config = &resources.config;
        Self {
            resources,
            resizer: FrameResizer::new(config.max_width),
            skip: FrameSkip::new(config.frame_skip),
            tracker: LandmarkTracker::new(detector, config.landmark_interval),
            warper: WarpEngine::new(),
            glitcher: GlitchGenerator::new(config),
            rng: RandomStream::new(config.seed),
            last_processed: None,
            frame_index: 0,
            prof: StageTimings::default(),
        }
    }

    /// Transform the next frame of the video in place.
    ///
    /// The frame is first capped to `max_width`; its dimensions afterwards
    /// are the output dimensions. Its `pts` is never changed.
    pub fn process(&mut self, frame: &mut RgbFrame) -> Result<FrameOutcome> {
        let index = self.frame_index;
        self.frame_index += 1;

        self.resizer
            .apply(frame)
            .with_context(|| format!("failed to resize frame {index}"))?;

        let outcome = match self.skip.action(index, self.last_processed.is_some()) {
            FrameAction::Reuse => self.reuse(frame)?,
            FrameAction::Process => self.process_full(frame, index)?,
        };

        tracing::debug!(frame = index, ?outcome, "frame done");
        self.log_timings();
        Ok(outcome)
    }

    fn reuse(&mut self, frame: &mut RgbFrame) -> Result<FrameOutcome> {
        let last = self
            .last_processed
            .as_ref()
            .context("no processed frame to reuse")?;
        anyhow::ensure!(
            (last.width, last.height) == (frame.width, frame.height),
            "frame size changed mid-video: {}x{} → {}x{}",
            last.width,
            last.height,
            frame.width,
            frame.height
        );
        frame.data.copy_from_slice(&last.data);
        self.prof.reused += 1;
        Ok(FrameOutcome::Reused)
    }

    fn process_full(&mut self, frame: &mut RgbFrame, index: u64) -> Result<FrameOutcome> {
        if let Some(last) = &self.last_processed {
            anyhow::ensure!(
                (last.width, last.height) == (frame.width, frame.height),
                "frame size changed mid-video: {}x{} → {}x{}",
                last.width,
                last.height,
                frame.width,
                frame.height
            );
        }

        let start = Instant::now();
        let landmarks = self.tracker.track(frame, index);
        self.prof.detect += start.elapsed();

        let mut overlaid = false;
        if let Some(set) = landmarks {
            let start = Instant::now();
            let overlay = self
                .warper
                .warp(&self.resources.mask, &set, frame.width, frame.height);
            self.prof.warp += start.elapsed();

            // A degenerate transform leaves the frame untouched: no overlay,
            // and no glitch either.
            if let Some(overlay) = overlay {
                let start = Instant::now();
                composite(frame, overlay)?;
                self.prof.composite += start.elapsed();

                let start = Instant::now();
                self.glitcher.apply(frame, &mut self.rng);
                self.prof.glitch += start.elapsed();
                overlaid = true;
            }
        }

        match self.last_processed.as_mut() {
            Some(last) => last.data.copy_from_slice(&frame.data),
            None => self.last_processed = Some(frame.clone()),
        }
        self.prof.processed += 1;
        if overlaid {
            self.prof.overlaid += 1;
        }

        Ok(FrameOutcome::Processed {
            landmarks,
            overlaid,
        })
    }

    fn log_timings(&self) {
        let p = &self.prof;
        let frames = p.processed + p.reused;
        if frames == 0 || frames % TIMING_LOG_EVERY != 0 {
            return;
        }
        let per_frame = |d: Duration| format!("{:.2}", d.as_secs_f64() * 1000.0 / frames as f64);
        tracing::info!(
            frames,
            processed = p.processed,
            reused = p.reused,
            overlaid = p.overlaid,
            detect_ms_per_frame = per_frame(p.detect),
            warp_ms_per_frame = per_frame(p.warp),
            composite_ms_per_frame = per_frame(p.composite),
            glitch_ms_per_frame = per_frame(p.glitch),
            "pipeline timings"
        );
    }

    /// Number of frames seen so far.
    pub fn frames(&self) -> u64 {
        self.frame_index
    }

    /// The most recent fully processed output, if any.
    pub fn last_processed(&self) -> Option<&RgbFrame> {
        self.last_processed.as_ref()
    }

    pub fn tracker(&self) -> &LandmarkTracker<D> {
        &self.tracker
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_frame_always_processed() {
        let skip = FrameSkip::new(3);
        assert_eq!(skip.action(0, false), FrameAction::Process);
        assert_eq!(skip.action(0, true), FrameAction::Process);
    }

    #[test]
    fn skip_pattern() {
        let skip = FrameSkip::new(3);
        let actions: Vec<_> = (0..7).map(|i| skip.action(i, true)).collect();
        use FrameAction::*;
        assert_eq!(
            actions,
            vec![Process, Reuse, Reuse, Process, Reuse, Reuse, Process]
        );
    }

    #[test]
    fn interval_one_processes_everything() {
        let skip = FrameSkip::new(1);
        assert!((0..10).all(|i| skip.action(i, true) == FrameAction::Process));
    }

    #[test]
    fn nothing_to_reuse_means_process() {
        let skip = FrameSkip::new(2);
        assert_eq!(skip.action(1, false), FrameAction::Process);
    }
}
