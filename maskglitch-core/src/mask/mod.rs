//! mask — the RGBA mask template and the shared resource bundle
//!
//! Loaded once at startup. A problem with either file is fatal for the whole
//! run since every video depends on it.

use std::path::Path;

use anyhow::Result;
use image::{ColorType, RgbaImage};
use nalgebra::Point2;
use serde::Deserialize;
use tracing::info;

use crate::config::Config;
use crate::error::Error;

/// The three alignment anchors in the mask's own pixel space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaskAnchors {
    pub left_eye: Point2<f32>,
    pub right_eye: Point2<f32>,
    pub chin: Point2<f32>,
}

#[derive(Deserialize)]
struct AnchorFile {
    left_eye: [f32; 2],
    right_eye: [f32; 2],
    chin: [f32; 2],
}

impl MaskAnchors {
    /// Parse `{"left_eye": [x, y], "right_eye": [x, y], "chin": [x, y]}`.
    pub fn from_json_str(text: &str) -> std::result::Result<Self, String> {
        let raw: AnchorFile = serde_json::from_str(text).map_err(|e| e.to_string())?;
        let anchors = Self {
            left_eye: Point2::new(raw.left_eye[0], raw.left_eye[1]),
            right_eye: Point2::new(raw.right_eye[0], raw.right_eye[1]),
            chin: Point2::new(raw.chin[0], raw.chin[1]),
        };
        if anchors.points().iter().any(|p| !p.x.is_finite() || !p.y.is_finite()) {
            return Err("anchor coordinates must be finite".into());
        }
        Ok(anchors)
    }

    /// Anchors in solve order: left eye, right eye, chin.
    pub fn points(&self) -> [Point2<f32>; 3] {
        [self.left_eye, self.right_eye, self.chin]
    }
}

/// An RGBA mask image with its three anchors. Never mutated after load.
#[derive(Debug, Clone)]
pub struct MaskTemplate {
    image: RgbaImage,
    anchors: MaskAnchors,
}

impl MaskTemplate {
    pub fn new(image: RgbaImage, anchors: MaskAnchors) -> Self {
        Self { image, anchors }
    }

    /// Load the mask PNG and its JSON anchor description.
    pub fn load<P: AsRef<Path>, Q: AsRef<Path>>(mask_path: P, anchors_path: Q) -> Result<Self> {
        let mask_path = mask_path.as_ref();
        let anchors_path = anchors_path.as_ref();

        let dynamic = image::open(mask_path).map_err(|e| Error::resource(mask_path, e.to_string()))?;
        if dynamic.color() != ColorType::Rgba8 {
            return Err(Error::resource(
                mask_path,
                format!("expected an 8-bit RGBA image, found {:?}", dynamic.color()),
            )
            .into());
        }
        let image = dynamic.into_rgba8();

        let text = std::fs::read_to_string(anchors_path)
            .map_err(|e| Error::resource(anchors_path, e.to_string()))?;
        let anchors =
            MaskAnchors::from_json_str(&text).map_err(|reason| Error::resource(anchors_path, reason))?;

        info!(
            width = image.width(),
            height = image.height(),
            ?anchors,
            "loaded mask template"
        );

        Ok(Self { image, anchors })
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn anchors(&self) -> &MaskAnchors {
        &self.anchors
    }
}

/// Everything shared read-only by every per-video pipeline.
#[derive(Debug, Clone)]
pub struct Resources {
    pub config: Config,
    pub mask: MaskTemplate,
}

impl Resources {
    pub fn new(config: Config, mask: MaskTemplate) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, mask })
    }

    pub fn load<P: AsRef<Path>, Q: AsRef<Path>>(
        config: Config,
        mask_path: P,
        anchors_path: Q,
    ) -> Result<Self> {
        config.validate()?;
        let mask = MaskTemplate::load(mask_path, anchors_path)?;
        Ok(Self { config, mask })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_anchor_json() {
        let anchors = MaskAnchors::from_json_str(
            r#"{"left_eye": [120, 200], "right_eye": [280.5, 198], "chin": [200, 410]}"#,
        )
        .unwrap();
        assert_eq!(anchors.left_eye, Point2::new(120.0, 200.0));
        assert_eq!(anchors.right_eye, Point2::new(280.5, 198.0));
        assert_eq!(anchors.chin, Point2::new(200.0, 410.0));
    }

    #[test]
    fn missing_anchor_is_rejected() {
        let err = MaskAnchors::from_json_str(r#"{"left_eye": [1, 2], "right_eye": [3, 4]}"#)
            .unwrap_err();
        assert!(err.contains("chin"), "{err}");
    }

    #[test]
    fn missing_mask_file_is_resource_error() {
        let err = MaskTemplate::load("/nonexistent/mask.png", "/nonexistent/mask.json").unwrap_err();
        match err.downcast_ref::<Error>() {
            Some(Error::ResourceMissing { path, .. }) => {
                assert_eq!(path, Path::new("/nonexistent/mask.png"))
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn non_rgba_mask_is_rejected() {
        let dir = std::env::temp_dir().join(format!("maskglitch-mask-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let mask_path = dir.join("rgb.png");
        image::RgbImage::new(4, 4).save(&mask_path).unwrap();

        let err = MaskTemplate::load(&mask_path, dir.join("unused.json")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::ResourceMissing { .. })
        ));
        std::fs::remove_dir_all(&dir).ok();
    }
}
