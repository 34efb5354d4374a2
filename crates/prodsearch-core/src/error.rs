use thiserror::Error;

/// Errors that can occur in prodsearch-core.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// A record line could not be parsed.
    #[error("Parse error on line {line}: {message}")]
    Parse {
        /// 1-based line number.
        line: usize,
        /// Parser message.
        message: String,
    },
    /// No usable interactions (empty corpus or empty training split).
    #[error("Empty dataset: {0}")]
    EmptyDataset(String),
    /// Invalid configuration value.
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
}

/// Result type alias for prodsearch-core.
pub type Result<T> = std::result::Result<T, Error>;
