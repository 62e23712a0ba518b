//! Error types shared across the crate.

use std::path::PathBuf;

use thiserror::Error;

/// Crate-wide error type.
///
/// Configuration and shape errors are fatal for the operation that raised
/// them; checkpoint errors are fatal at startup. Chart/sink failures are
/// not represented here: sinks return their own error type and callers log
/// it without aborting (see `training::sink`).
#[derive(Error, Debug)]
pub enum PixelClError {
    /// Unknown loss, network, pruning method or dataset subset, or an
    /// incompatible combination of them.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Mismatched array lengths or an unexpected probability-vector width.
    #[error("data shape mismatch: {0}")]
    DataShape(String),

    /// Missing checkpoint directory, no loadable checkpoint, or a filename
    /// that does not follow the checkpoint naming pattern.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("dataset error at {path:?}: {message}")]
    Dataset { path: PathBuf, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PixelClError>;

impl PixelClError {
    /// Shorthand for a configuration error with a formatted message.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Shorthand for a shape error with a formatted message.
    pub fn shape(message: impl Into<String>) -> Self {
        Self::DataShape(message.into())
    }
}
