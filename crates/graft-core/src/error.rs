//! Error types for graft.

use thiserror::Error;

/// Result type alias for graft core operations.
pub type Result<T> = std::result::Result<T, GraftError>;

/// Main error type for configuration and tensor-handle operations.
#[derive(Error, Debug)]
pub enum GraftError {
    /// Configuration errors.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Tensor byte length does not match its dtype and shape.
    #[error("Tensor byte length mismatch: shape {shape:?} needs {expected} bytes, got {actual}")]
    ByteLength {
        /// Tensor shape.
        shape: Vec<usize>,
        /// Expected byte length.
        expected: usize,
        /// Actual byte length.
        actual: usize,
    },

    /// I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing errors.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}
