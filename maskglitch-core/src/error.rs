//! Fatal error taxonomy.
//!
//! Recoverable conditions (a detector miss, a degenerate transform) never
//! surface here; they are `Option`s in the pipeline. Everything below aborts
//! either the whole run (`ResourceMissing`, `InvalidConfig`) or one file.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Mask image or anchor description absent, not RGBA, or malformed.
    #[error("resource {}: {reason}", path.display())]
    ResourceMissing { path: PathBuf, reason: String },

    /// Source video (or its first frame) could not be read.
    #[error("{}: decode failed during {stage}", file.display())]
    Decode {
        file: PathBuf,
        stage: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// Video-only output could not be encoded or written.
    #[error("{}: encode failed during {stage}", file.display())]
    Encode {
        file: PathBuf,
        stage: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// Audio remux step failed; the final output was not left behind.
    #[error("{}: audio remux failed during {stage}", file.display())]
    Mux {
        file: PathBuf,
        stage: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    pub fn resource(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::ResourceMissing {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// The file this error is attributed to, if any.
    pub fn file(&self) -> Option<&std::path::Path> {
        match self {
            Self::ResourceMissing { path, .. } => Some(path),
            Self::Decode { file, .. } | Self::Encode { file, .. } | Self::Mux { file, .. } => {
                Some(file)
            }
            Self::InvalidConfig(_) => None,
        }
    }
}
