//! Engine error types

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the inference engine and its components.
#[derive(Error, Debug)]
pub enum EngineError {
    /// A required persisted artifact is absent
    #[error("Artifact missing: {}", path.display())]
    ArtifactMissing { path: PathBuf },

    /// An artifact exists but its contents are unusable
    #[error("Invalid artifact: {0}")]
    InvalidArtifact(String),

    /// Dimensionality or image size disagrees between config and artifacts
    #[error("Config mismatch: {0}")]
    ConfigMismatch(String),

    /// Configuration values are out of range
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// Requested GPU is absent and fallback is forbidden
    #[error("Device GPU.{device_id} unavailable: {reason}")]
    DeviceUnavailable { device_id: u32, reason: String },

    /// Input image or embedded grid does not match the expected shape
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        got: (usize, usize),
    },

    /// Background persistence failed
    #[error("Persistence failed: {0}")]
    Persistence(String),

    /// Operation requires a ready engine
    #[error("Engine '{model}' not ready (status: {status})")]
    EngineNotReady { model: String, status: String },

    /// Cached image id is unknown
    #[error("Not found: {0}")]
    NotFound(String),

    /// Feature extraction backbone failed
    #[error("Backbone error: {0}")]
    Backbone(String),

    /// Async runtime unavailable or task failure
    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

impl EngineError {
    /// Whether this error only affects the single call that raised it.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            EngineError::ShapeMismatch { .. }
                | EngineError::NotFound(_)
                | EngineError::EngineNotReady { .. }
                | EngineError::Image(_)
        )
    }
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
