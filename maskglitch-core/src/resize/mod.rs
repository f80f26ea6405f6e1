//! resize — cap frame width before anything else looks at the frame
//!
//! Every downstream coordinate (landmarks, overlay, glitch bands) lives in
//! the resized space, so the scale factor is never kept around.

use anyhow::{Context, Result};
use fast_image_resize as fr;

use crate::video::RgbFrame;

/// Output size for a `width × height` frame capped at `max_width`.
pub fn fit_width(width: u32, height: u32, max_width: u32) -> (u32, u32) {
    if width <= max_width {
        return (width, height);
    }
    // Integer floor of height * (max_width / width), free of float rounding.
    let scaled_h = (height as u64 * max_width as u64 / width as u64) as u32;
    (max_width, scaled_h.max(1))
}

/// Reusable resize context to avoid per-frame allocations.
pub struct FrameResizer {
    max_width: u32,
    resizer: fr::Resizer,
    out_buf: Vec<u8>,
}

impl FrameResizer {
    pub fn new(max_width: u32) -> Self {
        Self {
            max_width,
            resizer: fr::Resizer::new(),
            out_buf: Vec::new(),
        }
    }

    /// Downscale `frame` in place if it is wider than the configured maximum.
    /// Returns whether the frame was resized.
    pub fn apply(&mut self, frame: &mut RgbFrame) -> Result<bool> {
        let (out_w, out_h) = fit_width(frame.width, frame.height, self.max_width);
        if out_w == frame.width && out_h == frame.height {
            return Ok(false);
        }

        let src =
            fr::images::ImageRef::new(frame.width, frame.height, &frame.data, fr::PixelType::U8x3)
                .context("failed to create fast_image_resize source for frame")?;

        let out_len = (out_w * out_h * 3) as usize;
        if self.out_buf.len() != out_len {
            self.out_buf.resize(out_len, 0);
        }
        let mut dst = fr::images::Image::from_vec_u8(
            out_w,
            out_h,
            std::mem::take(&mut self.out_buf),
            fr::PixelType::U8x3,
        )
        .context("failed to create fast_image_resize destination for frame")?;

        let options = fr::ResizeOptions::new()
            .resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear));
        self.resizer
            .resize(&src, &mut dst, Some(&options))
            .context("fast_image_resize frame downscale failed")?;

        // Hand the old (larger) buffer back for reuse on the next frame.
        self.out_buf = std::mem::replace(&mut frame.data, dst.into_vec());
        frame.width = out_w;
        frame.height = out_h;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn narrow_frames_pass_through() {
        assert_eq!(fit_width(640, 480, 1280), (640, 480));
        assert_eq!(fit_width(1280, 720, 1280), (1280, 720));
    }

    #[test]
    fn wide_frames_keep_aspect() {
        assert_eq!(fit_width(1920, 1080, 1280), (1280, 720));
        assert_eq!(fit_width(3840, 2160, 1280), (1280, 720));
        assert_eq!(fit_width(1000, 333, 500), (500, 166));
        assert_eq!(fit_width(4000, 1, 100), (100, 1));
    }

    #[test]
    fn resizes_in_place() {
        let mut frame = RgbFrame::new(8, 4);
        frame.data.fill(200);
        frame.pts = 17;
        let mut resizer = FrameResizer::new(4);
        assert!(resizer.apply(&mut frame).unwrap());
        assert_eq!((frame.width, frame.height), (4, 2));
        assert_eq!(frame.data.len(), 4 * 2 * 3);
        assert_eq!(frame.pts, 17);
        // A flat image stays flat under bilinear filtering.
        assert!(frame.data.iter().all(|&v| v == 200));
    }

    #[test]
    fn untouched_when_narrow_enough() {
        let mut frame = RgbFrame::new(4, 4);
        frame.data[0] = 9;
        let before = frame.clone();
        let mut resizer = FrameResizer::new(4);
        assert!(!resizer.apply(&mut frame).unwrap());
        assert_eq!(frame, before);
    }
}
