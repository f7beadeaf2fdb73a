//! Core trait definitions.

use crate::StateDict;

/// An object that can produce its own state dict.
///
/// This is the in-memory counterpart of a full trainable-object snapshot:
/// anything holding named parameters can be handed to the extractor wrapped
/// in [`CheckpointValue::Module`](crate::CheckpointValue::Module).
pub trait StateDictProvider: Send + Sync {
    /// Return the flat parameter mapping.
    fn state_dict(&self) -> StateDict;
}

impl StateDictProvider for StateDict {
    fn state_dict(&self) -> StateDict {
        self.clone()
    }
}
