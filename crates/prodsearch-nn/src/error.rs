//! Error types for prodsearch-nn.

use thiserror::Error;

/// Model, training and checkpoint errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Candle tensor error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Data layer error.
    #[error(transparent)]
    Core(#[from] prodsearch_core::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error (checkpoint metadata).
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Dimension mismatch.
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    /// Invalid configuration.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Training error.
    #[error("training error: {0}")]
    Training(String),

    /// Checkpoint does not fit the data or is incomplete.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
