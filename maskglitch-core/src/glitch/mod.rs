//! glitch — deterministic band-shift and channel-noise corruption
//!
//! Randomness comes from one seeded [`RandomStream`] per video, drawn in a
//! fixed order (all bands, then noise in row-major pixel order), so the same
//! seed over the same frames reproduces the same corruption byte for byte.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::{Config, MIN_BAND_HEIGHT};
use crate::video::RgbFrame;

/// The per-video pseudo-random sequence. Never shared between videos.
pub struct RandomStream {
    rng: StdRng,
}

impl RandomStream {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

/// One horizontal band corruption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandShift {
    /// First row of the band.
    pub row: u32,
    /// Requested band height; truncated at the bottom edge.
    pub height: u32,
    /// Horizontal shift in pixels; positive moves pixels right.
    pub shift: i32,
}

/// Circularly shift every row in `[row, row + height)` (clipped to the
/// frame) by `shift` pixels. Shifting by `s` and then `-s` is the identity.
pub fn shift_band(frame: &mut RgbFrame, row: u32, height: u32, shift: i32) {
    if frame.width == 0 {
        return;
    }
    let offset = shift.rem_euclid(frame.width as i32) as usize * 3;
    if offset == 0 {
        return;
    }
    let end = row.saturating_add(height).min(frame.height);
    for y in row..end {
        frame.row_mut(y).rotate_right(offset);
    }
}

/// Applies `glitch_intensity` band shifts plus channel noise.
pub struct GlitchGenerator {
    intensity: u32,
    max_band_height: u32,
    max_shift: i32,
    noise_level: u16,
    noise_channel: usize,
}

impl GlitchGenerator {
    pub fn new(config: &Config) -> Self {
        Self {
            intensity: config.glitch_intensity,
            max_band_height: config.max_band_width.max(MIN_BAND_HEIGHT),
            max_shift: config.max_shift.min(i32::MAX as u32) as i32,
            noise_level: config.noise_level.min(256),
            noise_channel: config.noise_channel.min(2) as usize,
        }
    }

    /// Draw the next band shift for a frame `height` rows tall.
    fn draw_band(&self, rng: &mut RandomStream, height: u32) -> BandShift {
        BandShift {
            row: rng.rng.gen_range(0..height),
            height: rng.rng.gen_range(MIN_BAND_HEIGHT..=self.max_band_height),
            shift: rng.rng.gen_range(-self.max_shift..=self.max_shift),
        }
    }

    /// Corrupt `frame` in place. Returns the band shifts that were applied.
    pub fn apply(&self, frame: &mut RgbFrame, rng: &mut RandomStream) -> Vec<BandShift> {
        if frame.width == 0 || frame.height == 0 {
            return Vec::new();
        }

        let bands: Vec<BandShift> = (0..self.intensity)
            .map(|_| {
                let band = self.draw_band(rng, frame.height);
                shift_band(frame, band.row, band.height, band.shift);
                band
            })
            .collect();

        if self.noise_level > 0 {
            let bound = self.noise_level;
            for px in frame.data.chunks_exact_mut(3) {
                let noise = rng.rng.gen_range(0..bound) as u8;
                let c = &mut px[self.noise_channel];
                *c = c.saturating_add(noise);
            }
        }

        bands
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> RgbFrame {
        let mut frame = RgbFrame::new(width, height);
        for (i, v) in frame.data.iter_mut().enumerate() {
            *v = (i * 7 % 251) as u8;
        }
        frame
    }

    #[test]
    fn shift_wraps_around() {
        let mut frame = RgbFrame::from_raw(3, 1, vec![1, 1, 1, 2, 2, 2, 3, 3, 3]).unwrap();
        shift_band(&mut frame, 0, 1, 1);
        assert_eq!(frame.data, vec![3, 3, 3, 1, 1, 1, 2, 2, 2]);
        shift_band(&mut frame, 0, 1, -2);
        assert_eq!(frame.data, vec![2, 2, 2, 3, 3, 3, 1, 1, 1]);
    }

    #[test]
    fn shift_round_trips() {
        let original = gradient(17, 9);
        for shift in [-40, -17, -3, 0, 1, 5, 16, 33] {
            let mut frame = original.clone();
            shift_band(&mut frame, 2, 4, shift);
            shift_band(&mut frame, 2, 4, -shift);
            assert_eq!(frame, original, "shift {shift}");
        }
    }

    #[test]
    fn shift_only_touches_band_rows() {
        let original = gradient(8, 10);
        let mut frame = original.clone();
        shift_band(&mut frame, 3, 2, 3);
        for y in (0..3).chain(5..10) {
            assert_eq!(frame.row(y), original.row(y));
        }
        assert_ne!(frame.row(3), original.row(3));
    }

    #[test]
    fn band_past_bottom_edge_is_clipped() {
        let original = gradient(6, 4);
        let mut frame = original.clone();
        shift_band(&mut frame, 3, 30, 2);
        assert_eq!(frame.row(2), original.row(2));
        assert_ne!(frame.row(3), original.row(3));
        shift_band(&mut frame, u32::MAX, 5, 2);
    }

    #[test]
    fn draws_stay_in_range() {
        let config = Config {
            max_band_width: 12,
            max_shift: 7,
            glitch_intensity: 200,
            noise_level: 0,
            ..Config::default()
        };
        let generator = GlitchGenerator::new(&config);
        let mut rng = RandomStream::new(3);
        let mut frame = gradient(20, 15);
        for band in generator.apply(&mut frame, &mut rng) {
            assert!(band.row < 15);
            assert!((5..=12).contains(&band.height));
            assert!((-7..=7).contains(&band.shift));
        }
    }

    #[test]
    fn noise_only_touches_designated_channel() {
        let config = Config {
            glitch_intensity: 0,
            noise_level: 40,
            noise_channel: 2,
            ..Config::default()
        };
        let generator = GlitchGenerator::new(&config);
        let mut rng = RandomStream::new(11);
        let original = gradient(10, 10);
        let mut frame = original.clone();
        generator.apply(&mut frame, &mut rng);
        for (after, before) in frame.data.chunks_exact(3).zip(original.data.chunks_exact(3)) {
            assert_eq!(after[..2], before[..2]);
            assert!(after[2] >= before[2]);
            assert!(after[2] - before[2] < 40 || after[2] == 255);
        }
    }

    #[test]
    fn same_seed_same_corruption() {
        let config = Config::default();
        let generator = GlitchGenerator::new(&config);
        let run = |seed| {
            let mut rng = RandomStream::new(seed);
            (0..3)
                .map(|_| {
                    let mut frame = gradient(64, 48);
                    generator.apply(&mut frame, &mut rng);
                    frame
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(run(42), run(42));
        assert_ne!(run(42), run(43));
    }

    #[test]
    fn noise_saturates() {
        let config = Config {
            glitch_intensity: 0,
            noise_level: 256,
            ..Config::default()
        };
        let generator = GlitchGenerator::new(&config);
        let mut frame = RgbFrame::from_raw(4, 1, vec![250; 12]).unwrap();
        generator.apply(&mut frame, &mut RandomStream::new(5));
        assert!(frame.data.chunks_exact(3).all(|px| px[0] == 250 && px[2] == 250));
    }
}
