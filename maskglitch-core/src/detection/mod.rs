//! detection — the landmark detector capability and its face-mesh backend
//!
//! The pipeline only knows [`LandmarkDetector`]: given a frame, maybe return
//! the three alignment anchors. [`FaceMeshDetector`] is the shipped backend,
//! a 468-point face-mesh ONNX model run through ONNX Runtime. The mesh only
//! works on a face-centred crop, so whenever nothing is tracked a BlazeFace
//! detector ([`FaceBoxDetector`]) finds the face first.

use anyhow::{Context, Result};
use fast_image_resize as fr;
use nalgebra::Point2;
use ort::session::Session;
use ort::value::Tensor;
use std::path::Path;
use tracing::debug;

use crate::video::RgbFrame;

mod blazeface;

pub use blazeface::{FaceBox, FaceBoxDetector};

/// The three anchors of one face, normalized to `[0, 1]` of the frame's
/// width and height.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceAnchors {
    pub left_eye: Point2<f32>,
    pub right_eye: Point2<f32>,
    pub chin: Point2<f32>,
}

/// Anything that can locate the tracked face in a frame.
///
/// `Ok(None)` is a miss. Errors are treated as misses by the tracker, so a
/// flaky backend degrades tracking instead of failing the file.
pub trait LandmarkDetector {
    fn detect(&mut self, frame: &RgbFrame) -> Result<Option<FaceAnchors>>;
}

impl<D: LandmarkDetector + ?Sized> LandmarkDetector for Box<D> {
    fn detect(&mut self, frame: &RgbFrame) -> Result<Option<FaceAnchors>> {
        (**self).detect(frame)
    }
}

// ── Face mesh backend ────────────────────────────────────────────────────────

/// Face-mesh model input size (square).
const MESH_SIZE: u32 = 192;
/// Number of mesh points the model emits (x, y, z each).
const MESH_POINTS: usize = 468;
/// Mesh indices of the anchors.
const LEFT_EYE: usize = 33;
const RIGHT_EYE: usize = 263;
const CHIN: usize = 152;
/// Minimum face-presence probability to accept a mesh.
const SCORE_THRESHOLD: f32 = 0.5;
/// Growth of a mesh or face box when deriving the next region of interest.
const ROI_EXPANSION: f32 = 1.5;

/// Square crop in frame pixels; may extend past the frame edges.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Roi {
    x: f32,
    y: f32,
    side: f32,
}

impl Roi {
    /// The whole frame, padded to a square.
    fn full_frame(width: u32, height: u32) -> Self {
        let side = width.max(height) as f32;
        Self {
            x: (width as f32 - side) / 2.0,
            y: (height as f32 - side) / 2.0,
            side,
        }
    }

    /// Square around `points`, grown by `ROI_EXPANSION`.
    fn around(points: &[Point2<f32>]) -> Option<Self> {
        let first = points.first()?;
        let (mut min, mut max) = (*first, *first);
        for p in points {
            min.x = min.x.min(p.x);
            min.y = min.y.min(p.y);
            max.x = max.x.max(p.x);
            max.y = max.y.max(p.y);
        }
        let side = (max.x - min.x).max(max.y - min.y) * ROI_EXPANSION;
        if !(side.is_finite() && side >= 1.0) {
            return None;
        }
        let cx = (min.x + max.x) / 2.0;
        let cy = (min.y + max.y) / 2.0;
        Some(Self {
            x: cx - side / 2.0,
            y: cy - side / 2.0,
            side,
        })
    }

    /// Square centred on a detected face box, grown by `ROI_EXPANSION`.
    fn around_box(face: &FaceBox) -> Option<Self> {
        let side = face.width.max(face.height) * ROI_EXPANSION;
        if !(side.is_finite() && side >= 1.0) {
            return None;
        }
        Some(Self {
            x: face.center.x - side / 2.0,
            y: face.center.y - side / 2.0,
            side,
        })
    }
}

/// Square crop → fixed-size NCHW float tensor, with reusable buffers.
struct SquareInput {
    size: u32,
    resizer: fr::Resizer,
    crop_buf: Vec<u8>,
    resize_buf: Vec<u8>,
}

impl SquareInput {
    fn new(size: u32) -> Self {
        Self {
            size,
            resizer: fr::Resizer::new(),
            crop_buf: Vec::new(),
            resize_buf: vec![0u8; (size * size * 3) as usize],
        }
    }

    /// Crop `roi` out of `frame`, resize it to `size × size` and lay it out
    /// as `[1, 3, size, size]`, mapping each byte through `to_unit`.
    fn tensor(
        &mut self,
        frame: &RgbFrame,
        roi: Roi,
        to_unit: fn(u8) -> f32,
    ) -> Result<ort::value::DynValue> {
        let side = roi.side.round().max(1.0) as u32;
        fill_square_crop(frame, roi.x.round() as i64, roi.y.round() as i64, side, &mut self.crop_buf);

        let src = fr::images::ImageRef::new(side, side, &self.crop_buf, fr::PixelType::U8x3)
            .context("failed to create model input resize source")?;
        let mut dst = fr::images::Image::from_vec_u8(
            self.size,
            self.size,
            std::mem::take(&mut self.resize_buf),
            fr::PixelType::U8x3,
        )
        .context("failed to create model input resize destination")?;

        let options = fr::ResizeOptions::new()
            .resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear));
        self.resizer
            .resize(&src, &mut dst, Some(&options))
            .context("fast_image_resize model input resize failed")?;
        self.resize_buf = dst.into_vec();

        let plane = (self.size * self.size) as usize;
        let mut tensor_data = vec![0f32; 3 * plane];
        for (idx, px) in self.resize_buf.chunks_exact(3).enumerate() {
            tensor_data[idx] = to_unit(px[0]);
            tensor_data[plane + idx] = to_unit(px[1]);
            tensor_data[2 * plane + idx] = to_unit(px[2]);
        }

        let shape = [1usize, 3, self.size as usize, self.size as usize];
        Ok(Tensor::from_array((shape, tensor_data.into_boxed_slice()))
            .context("failed to create model input tensor")?
            .into_dyn())
    }
}

/// Wraps the face-mesh ONNX session plus the face detector that seeds it.
///
/// Single-face only: it follows one face from frame to frame by cropping
/// around the previous mesh. After a miss it asks the face detector where to
/// look next; if that finds nothing either, the frame is a miss.
pub struct FaceMeshDetector {
    session: Session,
    input_name: String,
    input: SquareInput,
    face_finder: FaceBoxDetector,
    roi: Option<Roi>,
}

impl FaceMeshDetector {
    /// Load a face-mesh ONNX model (input `[1, 3, 192, 192]`, RGB in
    /// `[0, 1]`; outputs the 1404 mesh coordinates and a face-flag logit)
    /// and the short-range BlazeFace model used to acquire faces.
    ///
    /// `max_faces` above one is accepted but only one face is ever tracked.
    pub fn load<P: AsRef<Path>, Q: AsRef<Path>>(
        mesh_model_path: P,
        face_model_path: Q,
        max_faces: u32,
    ) -> Result<Self> {
        let session =
            build_ort_session(mesh_model_path.as_ref(), "failed to load face mesh ONNX model")?;
        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .context("face mesh model has no inputs")?;
        let face_finder = FaceBoxDetector::load(face_model_path)?;
        if max_faces > 1 {
            tracing::warn!(max_faces, "face mesh detector tracks a single face");
        }
        Ok(Self {
            session,
            input_name,
            input: SquareInput::new(MESH_SIZE),
            face_finder,
            roi: None,
        })
    }

    /// Region to run the mesh on: the tracked one, or a fresh one around
    /// whatever face the detector finds.
    fn region(&mut self, frame: &RgbFrame) -> Result<Option<Roi>> {
        if let Some(roi) = self.roi {
            return Ok(Some(roi));
        }
        let face = self.face_finder.detect(frame)?;
        debug!(?face, "face acquisition");
        Ok(face.as_ref().and_then(Roi::around_box))
    }
}

impl LandmarkDetector for FaceMeshDetector {
    fn detect(&mut self, frame: &RgbFrame) -> Result<Option<FaceAnchors>> {
        let Some(roi) = self.region(frame)? else {
            return Ok(None);
        };
        let input = self.input.tensor(frame, roi, |v| v as f32 / 255.0)?;

        let (mesh, logit) = {
            let outputs = self
                .session
                .run(ort::inputs![self.input_name.as_str() => input])
                .context("face mesh inference failed")?;

            let mut mesh = None;
            let mut logit = None;
            for (_name, value) in outputs.iter() {
                let (_shape, data) = value
                    .try_extract_tensor::<f32>()
                    .context("failed to extract face mesh output tensor")?;
                if data.len() >= MESH_POINTS * 3 && mesh.is_none() {
                    mesh = Some(data[..MESH_POINTS * 3].to_vec());
                } else if data.len() == 1 && logit.is_none() {
                    logit = Some(data[0]);
                }
            }
            (
                mesh.context("face mesh model produced no landmark output")?,
                logit,
            )
        };

        let score = logit.map(sigmoid).unwrap_or(1.0);
        if score < SCORE_THRESHOLD {
            debug!(score, "face mesh rejected");
            self.roi = None;
            return Ok(None);
        }

        // Mesh coordinates are in model-input pixels; map back to the frame.
        let scale = roi.side / MESH_SIZE as f32;
        let points: Vec<Point2<f32>> = mesh
            .chunks_exact(3)
            .map(|p| Point2::new(roi.x + p[0] * scale, roi.y + p[1] * scale))
            .collect();
        self.roi = Roi::around(&points);

        let normalize = |p: Point2<f32>| {
            Point2::new(p.x / frame.width as f32, p.y / frame.height as f32)
        };
        let anchors = FaceAnchors {
            left_eye: normalize(points[LEFT_EYE]),
            right_eye: normalize(points[RIGHT_EYE]),
            chin: normalize(points[CHIN]),
        };
        debug!(score, ?anchors, "face mesh accepted");
        Ok(Some(anchors))
    }
}

/// Copy the `side × side` square at `(x0, y0)` out of `frame` into `buf`,
/// zero-filling whatever falls outside the frame.
fn fill_square_crop(frame: &RgbFrame, x0: i64, y0: i64, side: u32, buf: &mut Vec<u8>) {
    let dst_stride = side as usize * 3;
    buf.clear();
    buf.resize(dst_stride * side as usize, 0);

    let x_start = x0.max(0);
    let x_end = (x0 + side as i64).min(frame.width as i64);
    if x_start >= x_end {
        return;
    }
    let copy_len = (x_end - x_start) as usize * 3;
    let dst_x = (x_start - x0) as usize * 3;

    for row in 0..side as i64 {
        let y = y0 + row;
        if y < 0 || y >= frame.height as i64 {
            continue;
        }
        let src_start = y as usize * frame.stride() + x_start as usize * 3;
        let dst_start = row as usize * dst_stride + dst_x;
        buf[dst_start..dst_start + copy_len]
            .copy_from_slice(&frame.data[src_start..src_start + copy_len]);
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

fn build_ort_session(model_path: &Path, load_error: &'static str) -> Result<Session> {
    let mut builder = Session::builder().context("failed to create ORT session builder")?;
    builder = builder
        .with_intra_threads(1)
        .context("failed to set ORT intra threads")?;
    builder = builder
        .with_inter_threads(1)
        .context("failed to set ORT inter threads")?;
    builder = builder
        .with_parallel_execution(false)
        .context("failed to set ORT parallel execution")?;
    builder.commit_from_file(model_path).context(load_error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_frame_roi_is_centered_square() {
        let roi = Roi::full_frame(200, 100);
        assert_eq!(roi, Roi { x: 0.0, y: -50.0, side: 200.0 });
    }

    #[test]
    fn roi_grows_around_points() {
        let roi = Roi::around(&[Point2::new(10.0, 20.0), Point2::new(30.0, 60.0)]).unwrap();
        assert_eq!(roi.side, 60.0);
        assert_eq!((roi.x, roi.y), (-10.0, 10.0));
        assert!(Roi::around(&[Point2::new(5.0, 5.0)]).is_none());
    }

    #[test]
    fn face_box_seeds_centred_square() {
        let face = FaceBox {
            center: Point2::new(640.0, 360.0),
            width: 200.0,
            height: 160.0,
            score: 0.9,
        };
        let roi = Roi::around_box(&face).unwrap();
        assert_eq!(roi, Roi { x: 490.0, y: 210.0, side: 300.0 });

        let empty = FaceBox { width: 0.0, height: 0.0, ..face };
        assert!(Roi::around_box(&empty).is_none());
    }

    #[test]
    fn crop_pads_outside_frame() {
        let mut frame = RgbFrame::new(2, 2);
        frame.data = vec![
            1, 1, 1, 2, 2, 2, //
            3, 3, 3, 4, 4, 4,
        ];
        let mut buf = Vec::new();
        fill_square_crop(&frame, -1, -1, 3, &mut buf);
        assert_eq!(
            buf,
            vec![
                0, 0, 0, 0, 0, 0, 0, 0, 0, //
                0, 0, 0, 1, 1, 1, 2, 2, 2, //
                0, 0, 0, 3, 3, 3, 4, 4, 4,
            ]
        );
    }

    #[test]
    fn crop_entirely_outside_is_black() {
        let frame = RgbFrame::new(2, 2);
        let mut buf = vec![7; 3];
        fill_square_crop(&frame, 5, 5, 2, &mut buf);
        assert_eq!(buf, vec![0; 12]);
    }
}
