//! Short-range BlazeFace face detector.
//!
//! Only used to acquire a face: the whole frame is letterboxed to 128×128,
//! and the best box above the score threshold becomes the mesh's first
//! region of interest.

use anyhow::{Context, Result};
use nalgebra::Point2;
use ort::session::Session;
use std::path::Path;

use super::{build_ort_session, sigmoid, Roi, SquareInput};
use crate::video::RgbFrame;

const INPUT_SIZE: u32 = 128;
/// 2 anchors per cell on the 16×16 grid, then 6 per cell on the 8×8 grid.
const ANCHOR_LAYERS: [(usize, u32); 2] = [(2, 16), (6, 8)];
const ANCHOR_COUNT: usize = 896;
/// Box centre, size and six keypoints per anchor.
const BOX_PARAMS: usize = 16;
const SCORE_THRESHOLD: f32 = 0.5;
/// Raw logits are clipped before the sigmoid, as MediaPipe does.
const LOGIT_CLIP: f32 = 100.0;

/// One detected face in frame pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceBox {
    pub center: Point2<f32>,
    pub width: f32,
    pub height: f32,
    pub score: f32,
}

impl FaceBox {
    /// Map a box in model-input pixels of the crop at `roi` back to frame pixels.
    fn to_frame(self, roi: Roi, input_size: u32) -> Self {
        let scale = roi.side / input_size as f32;
        Self {
            center: Point2::new(roi.x + self.center.x * scale, roi.y + self.center.y * scale),
            width: self.width * scale,
            height: self.height * scale,
            score: self.score,
        }
    }
}

/// Normalized SSD anchor centres, in the model's output order.
fn ssd_anchors() -> Vec<Point2<f32>> {
    let mut anchors = Vec::with_capacity(ANCHOR_COUNT);
    for (per_cell, grid) in ANCHOR_LAYERS {
        for y in 0..grid {
            for x in 0..grid {
                let center = Point2::new(
                    (x as f32 + 0.5) / grid as f32,
                    (y as f32 + 0.5) / grid as f32,
                );
                anchors.extend(std::iter::repeat(center).take(per_cell));
            }
        }
    }
    anchors
}

/// The highest-scoring box at or above `threshold`, in model-input pixels.
fn decode_best(
    boxes: &[f32],
    logits: &[f32],
    anchors: &[Point2<f32>],
    input_size: u32,
    threshold: f32,
) -> Option<FaceBox> {
    let size = input_size as f32;
    let (index, score, anchor) = logits
        .iter()
        .zip(anchors)
        .enumerate()
        .map(|(i, (&logit, anchor))| (i, sigmoid(logit.clamp(-LOGIT_CLIP, LOGIT_CLIP)), anchor))
        .filter(|&(_, score, _)| score >= threshold)
        .max_by(|a, b| a.1.total_cmp(&b.1))?;

    let params = boxes.get(index * BOX_PARAMS..index * BOX_PARAMS + 4)?;
    Some(FaceBox {
        center: Point2::new(params[0] + anchor.x * size, params[1] + anchor.y * size),
        width: params[2],
        height: params[3],
        score,
    })
}

/// Wraps the BlazeFace short-range ONNX session.
pub struct FaceBoxDetector {
    session: Session,
    input_name: String,
    input: SquareInput,
    anchors: Vec<Point2<f32>>,
}

impl FaceBoxDetector {
    /// Load `face_detection_short_range.onnx` (input `[1, 3, 128, 128]`, RGB
    /// in `[-1, 1]`; outputs `[1, 896, 16]` boxes and `[1, 896, 1]` logits).
    pub fn load<P: AsRef<Path>>(model_path: P) -> Result<Self> {
        let session =
            build_ort_session(model_path.as_ref(), "failed to load face detection ONNX model")?;
        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .context("face detection model has no inputs")?;
        Ok(Self {
            session,
            input_name,
            input: SquareInput::new(INPUT_SIZE),
            anchors: ssd_anchors(),
        })
    }

    /// The most confident face in `frame`, if any.
    pub fn detect(&mut self, frame: &RgbFrame) -> Result<Option<FaceBox>> {
        let roi = Roi::full_frame(frame.width, frame.height);
        let input = self
            .input
            .tensor(frame, roi, |v| v as f32 / 127.5 - 1.0)?;

        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => input])
            .context("face detection inference failed")?;

        let mut boxes = None;
        let mut logits = None;
        for (name, _) in outputs.iter() {
            let (_shape, data) = outputs[name]
                .try_extract_tensor::<f32>()
                .context("failed to extract face detection output tensor")?;
            match data.len() {
                n if n == ANCHOR_COUNT * BOX_PARAMS => boxes = Some(data),
                n if n == ANCHOR_COUNT => logits = Some(data),
                _ => {}
            }
        }
        let boxes = boxes.context("face detection model produced no box output")?;
        let logits = logits.context("face detection model produced no score output")?;

        Ok(decode_best(boxes, logits, &self.anchors, INPUT_SIZE, SCORE_THRESHOLD)
            .map(|face| face.to_frame(roi, INPUT_SIZE)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn anchors_follow_output_layout() {
        let anchors = ssd_anchors();
        assert_eq!(anchors.len(), ANCHOR_COUNT);
        assert_eq!(anchors[0], Point2::new(1.0 / 32.0, 1.0 / 32.0));
        assert_eq!(anchors[1], anchors[0]);
        assert_eq!(anchors[512], Point2::new(1.0 / 16.0, 1.0 / 16.0));
        assert_eq!(anchors[ANCHOR_COUNT - 1], Point2::new(15.0 / 16.0, 15.0 / 16.0));
    }

    fn raw_outputs(hits: &[(usize, f32, [f32; 4])]) -> (Vec<f32>, Vec<f32>) {
        let mut boxes = vec![0.0; ANCHOR_COUNT * BOX_PARAMS];
        let mut logits = vec![-10.0; ANCHOR_COUNT];
        for &(i, logit, params) in hits {
            logits[i] = logit;
            boxes[i * BOX_PARAMS..i * BOX_PARAMS + 4].copy_from_slice(&params);
        }
        (boxes, logits)
    }

    #[test]
    fn best_box_is_offset_from_its_anchor() {
        // Anchor 600 sits in cell (6, 1) of the 8×8 grid: (104, 24) in input pixels.
        let (boxes, logits) = raw_outputs(&[(3, 2.0, [9.0; 4]), (600, 4.0, [1.5, -2.0, 30.0, 40.0])]);
        let face = decode_best(&boxes, &logits, &ssd_anchors(), INPUT_SIZE, SCORE_THRESHOLD).unwrap();
        assert_relative_eq!(face.center.x, 105.5);
        assert_relative_eq!(face.center.y, 22.0);
        assert_eq!((face.width, face.height), (30.0, 40.0));
        assert_relative_eq!(face.score, sigmoid(4.0));
    }

    #[test]
    fn nothing_above_threshold_is_no_face() {
        let (boxes, logits) = raw_outputs(&[(10, -0.5, [50.0; 4])]);
        assert!(decode_best(&boxes, &logits, &ssd_anchors(), INPUT_SIZE, SCORE_THRESHOLD).is_none());
    }

    #[test]
    fn letterboxed_box_maps_back_to_frame() {
        // 1280×720 frame letterboxed into 128×128: 10 frame pixels per input pixel.
        let roi = Roi::full_frame(1280, 720);
        let face = FaceBox {
            center: Point2::new(64.0, 64.0),
            width: 20.0,
            height: 16.0,
            score: 0.8,
        }
        .to_frame(roi, INPUT_SIZE);
        assert_relative_eq!(face.center.x, 640.0);
        assert_relative_eq!(face.center.y, 360.0);
        assert_relative_eq!(face.width, 200.0);
        assert_relative_eq!(face.height, 160.0);
        assert_eq!(face.score, 0.8);
    }

    #[test]
    fn detection_seeds_a_face_sized_roi() {
        let (boxes, logits) = raw_outputs(&[(600, 3.0, [0.0, 0.0, 12.0, 10.0])]);
        let roi_full = Roi::full_frame(1280, 720);
        let face = decode_best(&boxes, &logits, &ssd_anchors(), INPUT_SIZE, SCORE_THRESHOLD)
            .unwrap()
            .to_frame(roi_full, INPUT_SIZE);
        let seed = Roi::around_box(&face).unwrap();

        // 120 px wide face → 180 px crop centred on it, far tighter than the frame.
        assert_relative_eq!(seed.side, 180.0);
        assert_relative_eq!(seed.x + seed.side / 2.0, face.center.x);
        assert_relative_eq!(seed.y + seed.side / 2.0, face.center.y);
    }
}
