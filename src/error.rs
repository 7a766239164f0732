//! Error taxonomy for the retrieval engine.
//!
//! Setup errors (`Config`, `LutLoad`) are fatal for a run. Everything else is
//! scoped to a single scene by the batch runner.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while configuring or running a retrieval.
#[derive(Debug, Error)]
pub enum RetrievalError {
    /// Missing or malformed configuration entry
    #[error("config error: {0}")]
    Config(String),

    /// LUT file missing, unparsable, or inconsistent with the configured grid
    #[error("LUT load error ({path}): {reason}")]
    LutLoad { path: PathBuf, reason: String },

    /// LUT data of the wrong shape or a corrupt binary cache
    #[error("LUT format error: {0}")]
    LutFormat(String),

    /// Angle or elevation outside grid coverage
    #[error("angle lookup failed: {0}")]
    AngleLookup(String),

    /// Outlier-filtered candidate pool came back empty
    #[error("no candidates left for {quantity} in [{low}, {high}]")]
    InsufficientCandidates {
        quantity: &'static str,
        low: f32,
        high: f32,
    },

    /// Raster layout or codec failure
    #[error("raster error ({path}): {reason}")]
    Raster { path: PathBuf, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RetrievalError>;

impl RetrievalError {
    pub(crate) fn lut(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::LutLoad {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn raster(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Raster {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}
