//! State-dict extraction.
//!
//! Checkpoints are saved in several conventional shapes: a bare tensor
//! mapping, a mapping that nests the weights under `"model"` or
//! `"state_dict"`, or a full object snapshot. [`classify`] decides which
//! shape a checkpoint has and [`extract`] normalizes all of them into one
//! flat [`StateDict`], so the merge never needs to know about loading
//! conventions.

use std::collections::BTreeMap;

use graft_core::{Checkpoint, CheckpointValue, StateDict, StateDictProvider};
use tracing::debug;

use crate::{MergeError, Result};

/// Fields that conventionally wrap the weights, in lookup order.
pub const WRAPPER_FIELDS: [&str; 2] = ["model", "state_dict"];

/// Detected layout of a checkpoint root.
#[derive(Clone, Copy)]
pub enum CheckpointShape<'a> {
    /// An object that produces its own state dict.
    HasStateAccessor(&'a dyn StateDictProvider),
    /// A mapping with the weights nested under the named field.
    WrapsUnder(&'static str),
    /// A mapping whose values are all tensors.
    FlatTensorMap,
    /// None of the above.
    Unrecognized,
}

impl CheckpointShape<'_> {
    /// Short description for logs and `inspect` output.
    pub fn describe(&self) -> String {
        match self {
            Self::HasStateAccessor(_) => "object with state_dict accessor".to_string(),
            Self::WrapsUnder(field) => format!("mapping wrapping weights under '{field}'"),
            Self::FlatTensorMap => "flat tensor mapping".to_string(),
            Self::Unrecognized => "unrecognized".to_string(),
        }
    }
}

impl std::fmt::Debug for CheckpointShape<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HasStateAccessor(_) => f.write_str("HasStateAccessor"),
            Self::WrapsUnder(field) => f.debug_tuple("WrapsUnder").field(field).finish(),
            Self::FlatTensorMap => f.write_str("FlatTensorMap"),
            Self::Unrecognized => f.write_str("Unrecognized"),
        }
    }
}

/// Classify a checkpoint root. First applicable rule wins:
///
/// 1. an object with a state-dict accessor;
/// 2. a mapping with a mapping under `"model"`, then under `"state_dict"`;
/// 3. a mapping whose every value is a tensor (an empty mapping qualifies);
/// 4. anything else.
pub fn classify(root: &CheckpointValue) -> CheckpointShape<'_> {
    match root {
        CheckpointValue::Module(provider) => CheckpointShape::HasStateAccessor(provider.as_ref()),
        CheckpointValue::Map(map) => {
            if let Some(field) = WRAPPER_FIELDS
                .into_iter()
                .find(|field| matches!(map.get(*field), Some(CheckpointValue::Map(_))))
            {
                return CheckpointShape::WrapsUnder(field);
            }
            if map.values().all(|v| matches!(v, CheckpointValue::Tensor(_))) {
                CheckpointShape::FlatTensorMap
            } else {
                CheckpointShape::Unrecognized
            }
        }
        _ => CheckpointShape::Unrecognized,
    }
}

/// Locate the flat state dict inside a loaded checkpoint.
///
/// Fails with [`MergeError::Extraction`] naming the checkpoint when no rule
/// applies, or when a wrapped mapping holds something other than tensors.
pub fn extract(checkpoint: &Checkpoint) -> Result<StateDict> {
    let root = checkpoint.root();
    let shape = classify(root);
    debug!(
        checkpoint = checkpoint.source(),
        shape = ?shape,
        "Classified checkpoint"
    );

    match shape {
        CheckpointShape::HasStateAccessor(provider) => Ok(provider.state_dict()),
        CheckpointShape::WrapsUnder(field) => {
            let nested = root
                .as_map()
                .and_then(|m| m.get(field))
                .and_then(CheckpointValue::as_map)
                .ok_or_else(|| extraction_error(checkpoint, format!("field '{field}' vanished")))?;
            tensors_only(nested).map_err(|(key, kind)| {
                extraction_error(
                    checkpoint,
                    format!("'{field}.{key}' is a {kind}, expected a tensor"),
                )
            })
        }
        CheckpointShape::FlatTensorMap => {
            let map = root
                .as_map()
                .ok_or_else(|| extraction_error(checkpoint, "root is not a mapping".to_string()))?;
            tensors_only(map).map_err(|(key, kind)| {
                extraction_error(checkpoint, format!("'{key}' is a {kind}, expected a tensor"))
            })
        }
        CheckpointShape::Unrecognized => Err(extraction_error(checkpoint, unrecognized_reason(root))),
    }
}

fn tensors_only(
    map: &BTreeMap<String, CheckpointValue>,
) -> std::result::Result<StateDict, (String, &'static str)> {
    map.iter()
        .map(|(key, value)| match value {
            CheckpointValue::Tensor(t) => Ok((key.clone(), t.clone())),
            other => Err((key.clone(), other.kind())),
        })
        .collect()
}

fn unrecognized_reason(root: &CheckpointValue) -> String {
    match root {
        CheckpointValue::Map(map) => {
            let offending: Vec<String> = map
                .iter()
                .filter(|(_, v)| !matches!(v, CheckpointValue::Tensor(_)))
                .take(3)
                .map(|(k, v)| format!("'{}' ({})", k, v.kind()))
                .collect();
            format!(
                "no 'model' or 'state_dict' mapping and non-tensor entries: {}",
                offending.join(", ")
            )
        }
        other => format!("root is a {}, not a mapping", other.kind()),
    }
}

fn extraction_error(checkpoint: &Checkpoint, reason: String) -> MergeError {
    MergeError::Extraction {
        checkpoint: checkpoint.source().to_string(),
        reason,
    }
}
