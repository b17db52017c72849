//! Error taxonomy shared by every model variant.

use std::path::PathBuf;
use thiserror::Error;

pub type ModelResult<T> = Result<T, ModelError>;

#[derive(Debug, Error)]
pub enum ModelError {
    /// Invalid combination of architecture, channel and initialization settings.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Tensor wiring that alignment cannot reconcile.
    #[error("shape mismatch in {stage}: {detail}")]
    ShapeMismatch { stage: &'static str, detail: String },
    #[error("failed to load backbone weights from {path}: {reason}")]
    Weights { path: PathBuf, reason: String },
}

impl ModelError {
    pub(crate) fn shape(stage: &'static str, detail: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            stage,
            detail: detail.into(),
        }
    }
}
