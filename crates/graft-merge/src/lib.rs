//! Student/teacher weight grafting.
//!
//! This crate merges a distilled student's weights into a teacher checkpoint
//! under prefix-based rules:
//!
//! - [`extract`]: locate the flat state dict inside any loaded checkpoint
//!   shape (bare mapping, `"model"`/`"state_dict"` wrapper, or an object
//!   with a state-dict accessor)
//! - [`WeightMerger`] / [`merge_state_dicts`]: rewrite student keys under
//!   the target prefix, drop superseded and skipped teacher keys, and count
//!   what happened to every teacher weight
//! - [`SafetensorsCheckpointLoader`] / [`SafetensorsCheckpointWriter`]:
//!   memory-mapped checkpoint I/O
//! - [`BatchConverter`]: convert a list of student configurations against
//!   one teacher
//!
//! # Example
//!
//! ```ignore
//! use graft_core::PrefixSpec;
//! use graft_merge::{extract, merge_state_dicts, CheckpointLoader, SafetensorsCheckpointLoader};
//!
//! let loader = SafetensorsCheckpointLoader::new();
//! let teacher = extract(&loader.load("sam3.pt".as_ref())?)?;
//! let student = extract(&loader.load("es_rv_s/ckpt_epoch_0.pth".as_ref())?)?;
//!
//! let outcome = merge_state_dicts(&student, &teacher, &PrefixSpec::with_target("image_encoder"));
//! println!("replaced {} appended {}", outcome.stats.replaced, outcome.stats.appended);
//! ```

#![warn(missing_docs)]

mod convert;
mod error;
mod extract;
mod loader;
mod merge;
mod prefix;

pub use convert::*;
pub use error::*;
pub use extract::*;
pub use loader::*;
pub use merge::*;
pub use prefix::*;
