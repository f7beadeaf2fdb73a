//! Checkpoint loading and saving.
//!
//! Checkpoints are stored as safetensors payloads. A checkpoint that nests its
//! weights under a field (the `{"model": weights}` layout) records the field
//! name in the header metadata under [`WRAPPER_METADATA_KEY`]; any other
//! header metadata rides along as bookkeeping values next to the wrapped
//! weights.
//!
//! # Zero-Copy Loading
//!
//! Files are memory-mapped and every loaded [`TensorHandle`] views its byte
//! range of the shared mapping, so loading a multi-gigabyte teacher costs no
//! copies and the merged output writes straight from the mapped pages.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use graft_core::{Checkpoint, CheckpointValue, StateDict, TensorHandle};
use memmap2::Mmap;
use safetensors::tensor::TensorView;
use safetensors::SafeTensors;
use tracing::{debug, info};

use crate::{MergeError, Result};

/// Header metadata key naming the field the weights are nested under.
pub const WRAPPER_METADATA_KEY: &str = "graft.wrapper";

/// Reads a checkpoint file into a [`Checkpoint`].
pub trait CheckpointLoader: Send + Sync {
    /// Load the checkpoint at `path`.
    fn load(&self, path: &Path) -> Result<Checkpoint>;
}

/// Persists a state dict.
pub trait CheckpointWriter: Send + Sync {
    /// Write `state` to `path`, recording `metadata` alongside it.
    fn save(&self, state: &StateDict, path: &Path, metadata: &BTreeMap<String, String>)
        -> Result<()>;
}

/// Memory-mapped safetensors checkpoint loader.
#[derive(Debug, Clone, Copy, Default)]
pub struct SafetensorsCheckpointLoader;

impl SafetensorsCheckpointLoader {
    /// Create a loader.
    pub fn new() -> Self {
        Self
    }
}

impl CheckpointLoader for SafetensorsCheckpointLoader {
    fn load(&self, path: &Path) -> Result<Checkpoint> {
        if !path.is_file() {
            return Err(MergeError::CheckpointNotFound(path.display().to_string()));
        }

        debug!("Memory-mapping {:?}", path);
        let file = File::open(path)?;
        // SAFETY: The file is opened read-only and the mapping is kept alive
        // by every tensor handle that views it.
        #[allow(unsafe_code)]
        let mmap = Arc::new(unsafe { Mmap::map(&file)? });

        let (_, header) = SafeTensors::read_metadata(&mmap)?;
        let metadata: BTreeMap<String, String> = header
            .metadata()
            .clone()
            .unwrap_or_default()
            .into_iter()
            .collect();

        let tensors = SafeTensors::deserialize(&mmap)?;
        let base_ptr = mmap.as_ptr() as usize;
        let mut state = StateDict::new();
        for (name, view) in tensors.tensors() {
            let data = view.data();
            let offset = data.as_ptr() as usize - base_ptr;
            let handle = TensorHandle::from_mapped(
                view.dtype(),
                view.shape().to_vec(),
                Arc::clone(&mmap),
                offset,
                data.len(),
            )?;
            state.insert(name, handle);
        }

        info!("Loaded {} tensors from {:?}", state.len(), path);

        let root = match metadata.get(WRAPPER_METADATA_KEY) {
            Some(field) if !field.is_empty() => {
                let mut root = BTreeMap::new();
                for (key, value) in &metadata {
                    if key != WRAPPER_METADATA_KEY {
                        root.insert(key.clone(), CheckpointValue::Text(value.clone()));
                    }
                }
                root.insert(field.clone(), CheckpointValue::from(state));
                CheckpointValue::Map(root)
            }
            _ => CheckpointValue::from(state),
        };

        Ok(Checkpoint::new(path.display().to_string(), root).with_metadata(metadata))
    }
}

/// Safetensors checkpoint writer.
///
/// By default the state dict is nested under `"model"`.
#[derive(Debug, Clone)]
pub struct SafetensorsCheckpointWriter {
    wrapper: Option<String>,
}

impl SafetensorsCheckpointWriter {
    /// Writer nesting the weights under `"model"`.
    pub fn new() -> Self {
        Self::with_wrapper("model")
    }

    /// Writer nesting the weights under `field`.
    pub fn with_wrapper(field: impl Into<String>) -> Self {
        Self {
            wrapper: Some(field.into()),
        }
    }

    /// Writer producing a bare tensor mapping.
    pub fn flat() -> Self {
        Self { wrapper: None }
    }

    /// Field the weights are nested under, if any.
    pub fn wrapper(&self) -> Option<&str> {
        self.wrapper.as_deref()
    }
}

impl Default for SafetensorsCheckpointWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl CheckpointWriter for SafetensorsCheckpointWriter {
    fn save(
        &self,
        state: &StateDict,
        path: &Path,
        metadata: &BTreeMap<String, String>,
    ) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let views = state
            .iter()
            .map(|(name, tensor)| {
                TensorView::new(tensor.dtype(), tensor.shape().to_vec(), tensor.data())
                    .map(|view| (name.as_str(), view))
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut info: HashMap<String, String> = metadata
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if let Some(field) = &self.wrapper {
            info.insert(WRAPPER_METADATA_KEY.to_string(), field.clone());
        }
        let info = (!info.is_empty()).then_some(info);

        safetensors::serialize_to_file(views, &info, path)?;
        debug!("Wrote {} tensors to {:?}", state.len(), path);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract;

    fn sample_state() -> StateDict {
        let mut state = StateDict::new();
        state.insert(
            "blk.0.w".to_string(),
            TensorHandle::from_f32(vec![2, 2], &[1.0, 2.0, 3.0, 4.0]).unwrap(),
        );
        state.insert(
            "blk.0.b".to_string(),
            TensorHandle::from_f32(vec![2], &[0.5, -0.5]).unwrap(),
        );
        state
    }

    #[test]
    fn test_missing_file() {
        let err = SafetensorsCheckpointLoader::new()
            .load(Path::new("/nonexistent/ckpt.pth"))
            .unwrap_err();
        assert!(matches!(err, MergeError::CheckpointNotFound(_)));
    }

    #[test]
    fn test_garbage_file_is_a_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.pt");
        std::fs::write(&path, b"definitely not safetensors").unwrap();

        let err = SafetensorsCheckpointLoader::new().load(&path).unwrap_err();
        assert!(matches!(err, MergeError::Safetensors(_)));
    }

    #[test]
    fn test_wrapped_checkpoint_loads_under_field() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("es_rv_s.pt");
        let mut metadata = BTreeMap::new();
        metadata.insert("epoch".to_string(), "0".to_string());

        SafetensorsCheckpointWriter::new()
            .save(&sample_state(), &path, &metadata)
            .unwrap();

        let ckpt = SafetensorsCheckpointLoader::new().load(&path).unwrap();
        let root = ckpt.root().as_map().unwrap();
        assert_eq!(root["model"].kind(), "map");
        assert!(matches!(&root["epoch"], CheckpointValue::Text(s) if s == "0"));
        assert_eq!(ckpt.metadata()[WRAPPER_METADATA_KEY], "model");
        assert!(ckpt.source().ends_with("es_rv_s.pt"));

        let state = extract(&ckpt).unwrap();
        assert_eq!(state.len(), 2);
        let w = &state["blk.0.w"];
        assert!(w.is_mapped());
        assert_eq!(w.shape(), &[2, 2]);
        let values: Vec<f32> = w
            .data()
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(values, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_flat_checkpoint_loads_as_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flat.safetensors");

        SafetensorsCheckpointWriter::flat()
            .save(&sample_state(), &path, &BTreeMap::new())
            .unwrap();

        let ckpt = SafetensorsCheckpointLoader::new().load(&path).unwrap();
        assert_eq!(ckpt.root().as_map().unwrap().len(), 2);
        assert!(ckpt.metadata().is_empty());
        assert_eq!(extract(&ckpt).unwrap().len(), 2);
    }

    #[test]
    fn test_unknown_wrapper_fails_extraction() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ema.pt");

        SafetensorsCheckpointWriter::with_wrapper("ema")
            .save(&sample_state(), &path, &BTreeMap::new())
            .unwrap();

        let ckpt = SafetensorsCheckpointLoader::new().load(&path).unwrap();
        let err = extract(&ckpt).unwrap_err();
        assert!(matches!(err, MergeError::Extraction { .. }));
        assert!(err.to_string().contains("ema.pt"));
    }
}
