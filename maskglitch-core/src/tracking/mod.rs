//! tracking — the stale-tolerant landmark cache
//!
//! The detector is expensive, so it only runs on every `landmark_interval`-th
//! frame index. Between detections, and after a miss, the last good
//! [`LandmarkSet`] is reused unchanged. Latency is traded for throughput.

use nalgebra::Point2;
use tracing::{debug, warn};

use crate::detection::{FaceAnchors, LandmarkDetector};
use crate::video::RgbFrame;

/// The tracked face's anchors in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LandmarkSet {
    pub left_eye: Point2<f32>,
    pub right_eye: Point2<f32>,
    pub chin: Point2<f32>,
}

impl LandmarkSet {
    /// Scale normalized detector output to pixel coordinates of a
    /// `width × height` frame, flooring to whole pixels.
    pub fn from_normalized(anchors: &FaceAnchors, width: u32, height: u32) -> Self {
        let to_px = |p: Point2<f32>| {
            Point2::new(
                (p.x * width as f32).floor(),
                (p.y * height as f32).floor(),
            )
        };
        Self {
            left_eye: to_px(anchors.left_eye),
            right_eye: to_px(anchors.right_eye),
            chin: to_px(anchors.chin),
        }
    }

    /// Points in solve order: left eye, right eye, chin.
    pub fn points(&self) -> [Point2<f32>; 3] {
        [self.left_eye, self.right_eye, self.chin]
    }
}

/// Outcome of a single `track` call, for logging and timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detection {
    /// Not a detection frame; the cache was returned as is.
    Skipped,
    /// The detector ran and replaced the cache.
    Hit,
    /// The detector ran (or failed) and found nothing; the cache is kept.
    Miss,
}

/// Owns the detector and the one active [`LandmarkSet`] of a video.
pub struct LandmarkTracker<D> {
    detector: D,
    landmark_interval: u64,
    last: Option<LandmarkSet>,
    last_detection: Detection,
}

impl<D: LandmarkDetector> LandmarkTracker<D> {
    pub fn new(detector: D, landmark_interval: u64) -> Self {
        Self {
            detector,
            landmark_interval: landmark_interval.max(1),
            last: None,
            last_detection: Detection::Skipped,
        }
    }

    /// Whether `frame_index` is a scheduled detection frame.
    pub fn should_detect(&self, frame_index: u64) -> bool {
        frame_index % self.landmark_interval == 0
    }

    /// Return the landmarks to use for `frame`, refreshing them first if
    /// `frame_index` is a detection frame. `None` until a face is found.
    pub fn track(&mut self, frame: &RgbFrame, frame_index: u64) -> Option<LandmarkSet> {
        if !self.should_detect(frame_index) {
            self.last_detection = Detection::Skipped;
            return self.last;
        }

        let found = match self.detector.detect(frame) {
            Ok(found) => found,
            Err(e) => {
                warn!(frame_index, "landmark detection error: {e:#}");
                None
            }
        };

        match found {
            Some(anchors) => {
                let set = LandmarkSet::from_normalized(&anchors, frame.width, frame.height);
                debug!(frame_index, ?set, "landmarks refreshed");
                self.last = Some(set);
                self.last_detection = Detection::Hit;
            }
            None => {
                debug!(
                    frame_index,
                    stale = self.last.is_some(),
                    "no face detected; keeping previous landmarks"
                );
                self.last_detection = Detection::Miss;
            }
        }
        self.last
    }

    /// The cached landmarks, without touching the detector.
    pub fn current(&self) -> Option<LandmarkSet> {
        self.last
    }

    /// What the most recent `track` call did.
    pub fn last_detection(&self) -> Detection {
        self.last_detection
    }

    pub fn detector(&self) -> &D {
        &self.detector
    }

    pub fn into_detector(self) -> D {
        self.detector
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Result};

    /// Returns queued results in order, then misses forever.
    struct Queue {
        results: Vec<Result<Option<FaceAnchors>>>,
        calls: usize,
    }

    impl LandmarkDetector for Queue {
        fn detect(&mut self, _frame: &RgbFrame) -> Result<Option<FaceAnchors>> {
            self.calls += 1;
            if self.results.is_empty() {
                Ok(None)
            } else {
                self.results.remove(0)
            }
        }
    }

    fn anchors(x: f32) -> FaceAnchors {
        FaceAnchors {
            left_eye: Point2::new(x, 0.25),
            right_eye: Point2::new(x + 0.2, 0.25),
            chin: Point2::new(x + 0.1, 0.75),
        }
    }

    #[test]
    fn scales_and_floors_to_pixels() {
        let set = LandmarkSet::from_normalized(&anchors(0.1), 100, 50);
        assert_eq!(set.left_eye, Point2::new(10.0, 12.0));
        assert_eq!(set.right_eye, Point2::new(30.0, 12.0));
        assert_eq!(set.chin, Point2::new(20.0, 37.0));
    }

    #[test]
    fn detects_only_on_interval() {
        let queue = Queue {
            results: vec![Ok(Some(anchors(0.1))), Ok(Some(anchors(0.3)))],
            calls: 0,
        };
        let mut tracker = LandmarkTracker::new(queue, 3);
        let frame = RgbFrame::new(100, 100);
        assert_eq!(tracker.current(), None);

        let first = tracker.track(&frame, 0);
        assert!(first.is_some());
        assert_eq!(tracker.current(), first);
        assert_eq!(tracker.last_detection(), Detection::Hit);
        assert_eq!(tracker.track(&frame, 1), first);
        assert_eq!(tracker.track(&frame, 2), first);
        assert_eq!(tracker.last_detection(), Detection::Skipped);
        assert_eq!(tracker.detector().calls, 1);

        let second = tracker.track(&frame, 3);
        assert_ne!(second, first);
        assert_eq!(tracker.current(), second);
        assert_eq!(tracker.detector().calls, 2);
    }

    #[test]
    fn miss_and_error_keep_stale_landmarks() {
        let queue = Queue {
            results: vec![
                Ok(Some(anchors(0.1))),
                Ok(None),
                Err(anyhow!("backend exploded")),
            ],
            calls: 0,
        };
        let mut tracker = LandmarkTracker::new(queue, 1);
        let frame = RgbFrame::new(64, 64);

        let first = tracker.track(&frame, 0);
        assert_eq!(tracker.track(&frame, 1), first);
        assert_eq!(tracker.last_detection(), Detection::Miss);
        assert_eq!(tracker.track(&frame, 2), first);
        assert_eq!(tracker.last_detection(), Detection::Miss);
    }

    #[test]
    fn absent_until_first_hit() {
        let queue = Queue {
            results: vec![],
            calls: 0,
        };
        let mut tracker = LandmarkTracker::new(queue, 2);
        let frame = RgbFrame::new(8, 8);
        for i in 0..6 {
            assert_eq!(tracker.track(&frame, i), None);
        }
        assert_eq!(tracker.into_detector().calls, 3);
    }
}
