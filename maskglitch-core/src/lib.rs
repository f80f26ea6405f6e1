pub mod batch;
pub mod config;
pub mod detection;
pub mod error;
pub mod glitch;
pub mod mask;
pub mod mux;
pub mod pipeline;
pub mod rendering;
pub mod resize;
pub mod runtime;
pub mod tracking;
pub mod video;
pub mod warp;

// Re-export the top-level result type so callers only need `maskglitch_core::Result`
pub use anyhow::Result;
pub use config::Config;
pub use mask::{MaskTemplate, Resources};
pub use pipeline::VideoPipeline;
