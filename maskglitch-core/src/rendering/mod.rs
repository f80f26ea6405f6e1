//! rendering — alpha-blend the warped overlay onto the frame
//!
//! The only place overlay pixels and live frame pixels meet. The output
//! stays opaque RGB24; overlay alpha is consumed, not kept.

use anyhow::{ensure, Result};
use image::RgbaImage;
use rayon::prelude::*;

use crate::video::RgbFrame;

/// Blend `overlay` over `frame` in place:
/// `out = a · overlay + (1 − a) · frame` with `a = alpha / 255`.
///
/// Fails only if the overlay does not match the frame's dimensions.
pub fn composite(frame: &mut RgbFrame, overlay: &RgbaImage) -> Result<()> {
    ensure!(
        overlay.dimensions() == (frame.width, frame.height),
        "overlay is {}x{} but frame is {}x{}",
        overlay.width(),
        overlay.height(),
        frame.width,
        frame.height
    );

    let row_rgb = frame.stride();
    let row_rgba = frame.width as usize * 4;
    frame
        .data
        .par_chunks_exact_mut(row_rgb)
        .zip(overlay.as_raw().par_chunks_exact(row_rgba))
        .for_each(|(dst_row, src_row)| {
            for (dst, src) in dst_row.chunks_exact_mut(3).zip(src_row.chunks_exact(4)) {
                blend_pixel(dst, src);
            }
        });
    Ok(())
}

#[inline]
fn blend_pixel(dst: &mut [u8], src: &[u8]) {
    match src[3] {
        0 => {}
        255 => dst.copy_from_slice(&src[..3]),
        alpha => {
            let a = alpha as f32 / 255.0;
            for c in 0..3 {
                let v = a * src[c] as f32 + (1.0 - a) * dst[c] as f32;
                // `as` saturates, which is the clamp to 0..=255.
                dst[c] = v as u8;
            }
        }
    }
}
