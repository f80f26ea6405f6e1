//! config — the immutable parameter bundle for a run
//!
//! Built once (defaults, then an optional TOML file, then CLI overrides) and
//! only ever borrowed afterwards.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Smallest band height the glitch generator draws.
pub const MIN_BAND_HEIGHT: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Frames wider than this are downscaled (aspect preserved).
    pub max_width: u32,
    /// Fully process every Nth frame; the rest re-emit the last output.
    pub frame_skip: u64,
    /// Run the landmark detector on every Nth frame index.
    pub landmark_interval: u64,
    /// Forwarded to the detector. Tracking only ever follows one face.
    pub max_faces: u32,
    /// Band-shift corruptions per processed frame.
    pub glitch_intensity: u32,
    /// Exclusive upper bound of the per-pixel channel noise.
    pub noise_level: u16,
    /// Largest band height, inclusive.
    pub max_band_width: u32,
    /// Largest horizontal shift magnitude, inclusive.
    pub max_shift: u32,
    pub seed: u64,
    /// Channel (0 = R, 1 = G, 2 = B) that receives the noise.
    pub noise_channel: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_width: 1280,
            frame_skip: 2,
            landmark_interval: 5,
            max_faces: 1,
            glitch_intensity: 3,
            noise_level: 80,
            max_band_width: 30,
            max_shift: 30,
            seed: 42,
            noise_channel: 1,
        }
    }
}

impl Config {
    /// Parse a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text).context("failed to parse config TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("in config file {}", path.display()))
    }

    pub fn validate(&self) -> Result<(), Error> {
        let invalid = |msg: &str| Err(Error::InvalidConfig(msg.to_string()));
        if self.max_width == 0 {
            return invalid("max_width must be at least 1");
        }
        if self.frame_skip == 0 {
            return invalid("frame_skip must be at least 1");
        }
        if self.landmark_interval == 0 {
            return invalid("landmark_interval must be at least 1");
        }
        if self.max_faces == 0 {
            return invalid("max_faces must be at least 1");
        }
        if self.max_band_width < MIN_BAND_HEIGHT {
            return Err(Error::InvalidConfig(format!(
                "max_band_width must be at least {MIN_BAND_HEIGHT}"
            )));
        }
        if self.noise_level > 256 {
            return invalid("noise_level must not exceed 256");
        }
        if self.noise_channel > 2 {
            return invalid("noise_channel must be 0, 1 or 2");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_width, 1280);
        assert_eq!(config.frame_skip, 2);
        assert_eq!(config.landmark_interval, 5);
        assert_eq!(config.seed, 42);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = Config::from_toml_str("frame_skip = 3\nseed = 7\n").unwrap();
        assert_eq!(config.frame_skip, 3);
        assert_eq!(config.seed, 7);
        assert_eq!(config.max_shift, Config::default().max_shift);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(Config::from_toml_str("frame_skipp = 3\n").is_err());
    }

    #[test]
    fn rejects_degenerate_values() {
        for text in [
            "frame_skip = 0",
            "landmark_interval = 0",
            "max_width = 0",
            "max_band_width = 4",
            "noise_level = 300",
            "noise_channel = 3",
        ] {
            let err = Config::from_toml_str(text).unwrap_err();
            assert!(
                err.downcast_ref::<Error>().is_some(),
                "{text}: expected InvalidConfig, got {err:#}"
            );
        }
    }
}
