//! Error types for extraction, merging and checkpoint I/O.

use thiserror::Error;

/// Errors that can occur while extracting, merging or persisting checkpoints.
#[derive(Debug, Error)]
pub enum MergeError {
    /// No flat tensor mapping could be located in a checkpoint.
    #[error("Unable to extract a state_dict from {checkpoint}: {reason}")]
    Extraction {
        /// Checkpoint identity (usually its path).
        checkpoint: String,
        /// What the extractor found instead.
        reason: String,
    },

    /// Checkpoint loading error.
    #[error("Failed to load checkpoint: {0}")]
    CheckpointLoad(String),

    /// Checkpoint file not found.
    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(String),

    /// Safetensors error.
    #[error("Safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    /// Core type or configuration error.
    #[error(transparent)]
    Core(#[from] graft_core::GraftError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for merge operations.
pub type Result<T> = std::result::Result<T, MergeError>;
