//! Core types and configuration for graft.
//!
//! This crate provides the foundational abstractions shared by the merge
//! library and the CLI:
//!
//! - [`TensorHandle`] and [`StateDict`]: opaque tensors and flat parameter maps
//! - [`Checkpoint`] and [`CheckpointValue`]: the loosely-structured object a
//!   checkpoint file loads into
//! - [`StateDictProvider`]: objects that can produce their own state dict
//! - [`ConversionConfig`] and [`PrefixSpec`]: batch conversion settings
//! - Error handling infrastructure

#![warn(missing_docs)]

mod config;
mod error;
mod traits;
mod types;

pub use config::*;
pub use error::*;
pub use traits::*;
pub use types::*;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::*;
    pub use crate::error::{GraftError, Result};
    pub use crate::traits::*;
    pub use crate::types::*;
}
