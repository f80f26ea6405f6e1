//! warp — fit the mask template onto the tracked face
//!
//! Three anchor correspondences determine an affine map exactly. The mask is
//! resampled through that map into a frame-sized RGBA overlay; everything the
//! mask does not cover comes out fully transparent.

use image::{Rgba, RgbaImage};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};
use nalgebra::{Matrix2x3, Matrix3, Point2, Vector3};
use tracing::warn;

use crate::mask::MaskTemplate;
use crate::tracking::LandmarkSet;

/// Triangles with less than this much (doubled) area count as collinear.
const DEGENERATE_AREA: f64 = 1e-6;

const TRANSPARENT: Rgba<u8> = Rgba([0, 0, 0, 0]);

/// A 2×3 affine transform: `[x', y']ᵀ = M · [x, y, 1]ᵀ`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Affine {
    m: Matrix2x3<f64>,
}

impl Affine {
    /// Solve the unique affine map taking `src[i]` to `dst[i]`.
    ///
    /// Returns `None` when either triangle is degenerate: a collinear source
    /// makes the system singular, a collinear destination makes the map
    /// non-invertible and the resample meaningless.
    pub fn solve(src: &[Point2<f32>; 3], dst: &[Point2<f32>; 3]) -> Option<Self> {
        if doubled_area(src).abs() < DEGENERATE_AREA || doubled_area(dst).abs() < DEGENERATE_AREA {
            return None;
        }

        let [s0, s1, s2] = src.map(|p| p.cast::<f64>());
        let [d0, d1, d2] = dst.map(|p| p.cast::<f64>());
        #[rustfmt::skip]
        let a = Matrix3::new(
            s0.x, s0.y, 1.0,
            s1.x, s1.y, 1.0,
            s2.x, s2.y, 1.0,
        );
        let lu = a.lu();
        let row_x = lu.solve(&Vector3::new(d0.x, d1.x, d2.x))?;
        let row_y = lu.solve(&Vector3::new(d0.y, d1.y, d2.y))?;

        #[rustfmt::skip]
        let m = Matrix2x3::new(
            row_x[0], row_x[1], row_x[2],
            row_y[0], row_y[1], row_y[2],
        );
        if m.iter().all(|v| v.is_finite()) {
            Some(Self { m })
        } else {
            None
        }
    }

    pub fn matrix(&self) -> &Matrix2x3<f64> {
        &self.m
    }

    pub fn apply(&self, p: Point2<f32>) -> Point2<f32> {
        let v = self.m * Vector3::new(p.x as f64, p.y as f64, 1.0);
        Point2::new(v[0] as f32, v[1] as f32)
    }

    /// The same map as an imageproc projection (source → destination).
    fn to_projection(self) -> Option<Projection> {
        let m = self.m.cast::<f32>();
        #[rustfmt::skip]
        let matrix = [
            m[(0, 0)], m[(0, 1)], m[(0, 2)],
            m[(1, 0)], m[(1, 1)], m[(1, 2)],
            0.0, 0.0, 1.0,
        ];
        Projection::from_matrix(matrix)
    }
}

/// Twice the signed area of a triangle.
fn doubled_area(t: &[Point2<f32>; 3]) -> f64 {
    let [a, b, c] = t.map(|p| p.cast::<f64>());
    (b.x - a.x) * (c.y - a.y) - (c.x - a.x) * (b.y - a.y)
}

/// Reusable warp context; the overlay buffer survives between frames.
pub struct WarpEngine {
    overlay: RgbaImage,
}

impl WarpEngine {
    pub fn new() -> Self {
        Self {
            overlay: RgbaImage::new(0, 0),
        }
    }

    /// Resample `mask` so its anchors land on `landmarks`, producing a
    /// `width × height` overlay. `None` if the transform is degenerate.
    pub fn warp(
        &mut self,
        mask: &MaskTemplate,
        landmarks: &LandmarkSet,
        width: u32,
        height: u32,
    ) -> Option<&RgbaImage> {
        let Some(projection) = Affine::solve(&mask.anchors().points(), &landmarks.points())
            .and_then(Affine::to_projection)
        else {
            warn!(?landmarks, "degenerate anchor triangle; skipping overlay");
            return None;
        };

        if self.overlay.dimensions() != (width, height) {
            self.overlay = RgbaImage::new(width, height);
        }
        // Every output pixel is written, transparent where the mask is absent.
        warp_into(
            mask.image(),
            &projection,
            Interpolation::Bilinear,
            TRANSPARENT,
            &mut self.overlay,
        );
        Some(&self.overlay)
    }
}

impl Default for WarpEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot convenience around [`WarpEngine::warp`].
pub fn warp_mask(
    mask: &MaskTemplate,
    landmarks: &LandmarkSet,
    width: u32,
    height: u32,
) -> Option<RgbaImage> {
    WarpEngine::new()
        .warp(mask, landmarks, width, height)
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::MaskAnchors;
    use approx::assert_relative_eq;

    fn p(x: f32, y: f32) -> Point2<f32> {
        Point2::new(x, y)
    }

    fn checker_mask() -> MaskTemplate {
        let image = RgbaImage::from_fn(20, 20, |x, y| {
            if (x / 4 + y / 4) % 2 == 0 {
                Rgba([255, 0, 0, 255])
            } else {
                Rgba([0, 0, 255, 128])
            }
        });
        let anchors = MaskAnchors {
            left_eye: p(5.0, 5.0),
            right_eye: p(15.0, 5.0),
            chin: p(10.0, 15.0),
        };
        MaskTemplate::new(image, anchors)
    }

    fn landmarks(points: [Point2<f32>; 3]) -> LandmarkSet {
        LandmarkSet {
            left_eye: points[0],
            right_eye: points[1],
            chin: points[2],
        }
    }

    #[test]
    fn solve_maps_all_three_anchors() {
        let src = [p(10.0, 10.0), p(50.0, 12.0), p(30.0, 60.0)];
        let dst = [p(100.0, 80.0), p(140.0, 95.0), p(105.0, 150.0)];
        let affine = Affine::solve(&src, &dst).unwrap();
        for (s, d) in src.iter().zip(dst.iter()) {
            let mapped = affine.apply(*s);
            assert_relative_eq!(mapped.x, d.x, epsilon = 1e-3);
            assert_relative_eq!(mapped.y, d.y, epsilon = 1e-3);
        }
    }

    #[test]
    fn pure_translation_solves_to_identity_plus_offset() {
        let src = [p(0.0, 0.0), p(10.0, 0.0), p(0.0, 10.0)];
        let dst = src.map(|s| p(s.x + 30.0, s.y - 5.0));
        let m = *Affine::solve(&src, &dst).unwrap().matrix();
        let expected = Matrix2x3::new(1.0, 0.0, 30.0, 0.0, 1.0, -5.0);
        for (got, want) in m.iter().zip(expected.iter()) {
            assert_relative_eq!(*got, *want, epsilon = 1e-9);
        }
    }

    #[test]
    fn solve_rejects_collinear_triangles() {
        let good = [p(0.0, 0.0), p(10.0, 0.0), p(0.0, 10.0)];
        let line = [p(0.0, 0.0), p(5.0, 5.0), p(10.0, 10.0)];
        assert!(Affine::solve(&line, &good).is_none());
        assert!(Affine::solve(&good, &line).is_none());
        let repeated = [p(3.0, 3.0), p(3.0, 3.0), p(8.0, 1.0)];
        assert!(Affine::solve(&good, &repeated).is_none());
    }

    #[test]
    fn identity_warp_reproduces_interior() {
        let mask = checker_mask();
        let anchors = mask.anchors().points();
        let overlay = warp_mask(&mask, &landmarks(anchors), 20, 20).unwrap();
        assert_eq!(overlay.dimensions(), (20, 20));
        for y in 1..18 {
            for x in 1..18 {
                assert_eq!(overlay.get_pixel(x, y), mask.image().get_pixel(x, y));
            }
        }
    }

    #[test]
    fn translated_warp_moves_mask_and_leaves_rest_transparent() {
        let mask = checker_mask();
        let shifted = mask.anchors().points().map(|a| p(a.x + 30.0, a.y + 10.0));
        let overlay = warp_mask(&mask, &landmarks(shifted), 64, 48).unwrap();
        assert_eq!(overlay.dimensions(), (64, 48));
        assert_eq!(overlay.get_pixel(35, 15), mask.image().get_pixel(5, 5));
        assert_eq!(overlay.get_pixel(42, 21), mask.image().get_pixel(12, 11));
        // Outside the mask footprint nothing is extrapolated.
        assert_eq!(overlay.get_pixel(2, 2)[3], 0);
        assert_eq!(overlay.get_pixel(60, 45)[3], 0);
        assert_eq!(overlay.get_pixel(10, 40)[3], 0);
    }

    #[test]
    fn degenerate_landmarks_yield_no_overlay() {
        let mask = checker_mask();
        let line = landmarks([p(10.0, 10.0), p(20.0, 20.0), p(30.0, 30.0)]);
        let mut engine = WarpEngine::new();
        assert!(engine.warp(&mask, &line, 40, 40).is_none());
    }

    #[test]
    fn overlay_follows_frame_size() {
        let mask = checker_mask();
        let set = landmarks(mask.anchors().points());
        let mut engine = WarpEngine::new();
        assert_eq!(engine.warp(&mask, &set, 32, 24).unwrap().dimensions(), (32, 24));
        assert_eq!(engine.warp(&mask, &set, 16, 40).unwrap().dimensions(), (16, 40));
    }
}
