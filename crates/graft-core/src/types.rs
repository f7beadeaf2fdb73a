//! Common type definitions: tensor handles, state dicts, and the loaded
//! checkpoint object model.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use memmap2::Mmap;
use safetensors::Dtype;

use crate::{GraftError, Result, StateDictProvider};

/// Flat mapping from parameter name to tensor.
///
/// Iteration is sorted by key so serialized output is reproducible.
pub type StateDict = BTreeMap<String, TensorHandle>;

/// Opaque, reference-counted handle to tensor data.
///
/// Cloning a handle never copies tensor bytes. Merging only moves handles
/// around, so identity (see [`TensorHandle::ptr_eq`]) is preserved from the
/// loaded checkpoint through to the writer.
#[derive(Clone)]
pub struct TensorHandle {
    inner: Arc<TensorBlob>,
}

struct TensorBlob {
    dtype: Dtype,
    shape: Vec<usize>,
    storage: TensorStorage,
}

enum TensorStorage {
    Owned(Vec<u8>),
    /// Byte range inside a memory-mapped checkpoint shared by every tensor
    /// loaded from the same file.
    Mapped {
        map: Arc<Mmap>,
        offset: usize,
        len: usize,
    },
}

impl TensorHandle {
    /// Create a handle owning `bytes`.
    ///
    /// Fails if the byte length does not match `dtype` and `shape`.
    pub fn from_bytes(dtype: Dtype, shape: Vec<usize>, bytes: Vec<u8>) -> Result<Self> {
        check_byte_length(dtype, &shape, bytes.len())?;
        Ok(Self::from_blob(TensorBlob {
            dtype,
            shape,
            storage: TensorStorage::Owned(bytes),
        }))
    }

    /// Create an F32 handle from host values.
    pub fn from_f32(shape: Vec<usize>, values: &[f32]) -> Result<Self> {
        let bytes: &[u8] = bytemuck::cast_slice(values);
        Self::from_bytes(Dtype::F32, shape, bytes.to_vec())
    }

    /// Create a handle viewing `len` bytes at `offset` of a shared mapping.
    pub fn from_mapped(
        dtype: Dtype,
        shape: Vec<usize>,
        map: Arc<Mmap>,
        offset: usize,
        len: usize,
    ) -> Result<Self> {
        let end = offset.checked_add(len).ok_or_else(|| {
            GraftError::InvalidArgument(format!("tensor range overflows: {offset}+{len}"))
        })?;
        if end > map.len() {
            return Err(GraftError::InvalidArgument(format!(
                "tensor range {offset}..{end} exceeds mapping of {} bytes",
                map.len()
            )));
        }
        check_byte_length(dtype, &shape, len)?;
        Ok(Self::from_blob(TensorBlob {
            dtype,
            shape,
            storage: TensorStorage::Mapped { map, offset, len },
        }))
    }

    fn from_blob(blob: TensorBlob) -> Self {
        Self {
            inner: Arc::new(blob),
        }
    }

    /// Element dtype.
    pub fn dtype(&self) -> Dtype {
        self.inner.dtype
    }

    /// Tensor shape.
    pub fn shape(&self) -> &[usize] {
        &self.inner.shape
    }

    /// Number of elements.
    pub fn num_elements(&self) -> usize {
        self.inner.shape.iter().product()
    }

    /// Raw little-endian bytes.
    pub fn data(&self) -> &[u8] {
        match &self.inner.storage {
            TensorStorage::Owned(bytes) => bytes,
            TensorStorage::Mapped { map, offset, len } => &map[*offset..*offset + *len],
        }
    }

    /// Size of the data in bytes.
    pub fn nbytes(&self) -> usize {
        match &self.inner.storage {
            TensorStorage::Owned(bytes) => bytes.len(),
            TensorStorage::Mapped { len, .. } => *len,
        }
    }

    /// Whether the bytes live in a memory-mapped file.
    pub fn is_mapped(&self) -> bool {
        matches!(self.inner.storage, TensorStorage::Mapped { .. })
    }

    /// Whether both handles refer to the same tensor.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for TensorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorHandle")
            .field("dtype", &self.inner.dtype)
            .field("shape", &self.inner.shape)
            .field("mapped", &self.is_mapped())
            .finish()
    }
}

fn check_byte_length(dtype: Dtype, shape: &[usize], actual: usize) -> Result<()> {
    let expected = shape.iter().product::<usize>() * dtype.size();
    if expected != actual {
        return Err(GraftError::ByteLength {
            shape: shape.to_vec(),
            expected,
            actual,
        });
    }
    Ok(())
}

/// A node of a loaded checkpoint.
///
/// Checkpoints on disk come in several shapes: a bare tensor mapping, a
/// mapping that nests the weights under a conventional field alongside
/// bookkeeping values, or a live object that can produce its own state dict.
#[derive(Clone)]
pub enum CheckpointValue {
    /// A tensor.
    Tensor(TensorHandle),
    /// A string value (notes, config names, ...).
    Text(String),
    /// An integer value (epoch, step, ...).
    Integer(i64),
    /// A floating point value (loss, learning rate, ...).
    Float(f64),
    /// A nested mapping.
    Map(BTreeMap<String, CheckpointValue>),
    /// An object exposing a state-dict accessor.
    Module(Arc<dyn StateDictProvider>),
}

impl CheckpointValue {
    /// Short name of the variant, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Tensor(_) => "tensor",
            Self::Text(_) => "text",
            Self::Integer(_) => "integer",
            Self::Float(_) => "float",
            Self::Map(_) => "map",
            Self::Module(_) => "module",
        }
    }

    /// The tensor, if this is one.
    pub fn as_tensor(&self) -> Option<&TensorHandle> {
        match self {
            Self::Tensor(t) => Some(t),
            _ => None,
        }
    }

    /// The nested mapping, if this is one.
    pub fn as_map(&self) -> Option<&BTreeMap<String, CheckpointValue>> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }
}

impl fmt::Debug for CheckpointValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tensor(t) => t.fmt(f),
            Self::Text(s) => f.debug_tuple("Text").field(s).finish(),
            Self::Integer(i) => f.debug_tuple("Integer").field(i).finish(),
            Self::Float(x) => f.debug_tuple("Float").field(x).finish(),
            Self::Map(m) => f.debug_map().entries(m.iter()).finish(),
            Self::Module(_) => f.write_str("Module(..)"),
        }
    }
}

impl From<TensorHandle> for CheckpointValue {
    fn from(t: TensorHandle) -> Self {
        Self::Tensor(t)
    }
}

impl From<String> for CheckpointValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for CheckpointValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<i64> for CheckpointValue {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<f64> for CheckpointValue {
    fn from(x: f64) -> Self {
        Self::Float(x)
    }
}

impl From<StateDict> for CheckpointValue {
    fn from(state: StateDict) -> Self {
        Self::Map(
            state
                .into_iter()
                .map(|(k, v)| (k, CheckpointValue::Tensor(v)))
                .collect(),
        )
    }
}

impl From<BTreeMap<String, CheckpointValue>> for CheckpointValue {
    fn from(map: BTreeMap<String, CheckpointValue>) -> Self {
        Self::Map(map)
    }
}

/// A loaded checkpoint: its identity, root object, and any file-level
/// string metadata.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    source: String,
    root: CheckpointValue,
    metadata: BTreeMap<String, String>,
}

impl Checkpoint {
    /// Create a checkpoint from its identity (usually the path) and root.
    pub fn new(source: impl Into<String>, root: impl Into<CheckpointValue>) -> Self {
        Self {
            source: source.into(),
            root: root.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// Wrap an already-flat state dict.
    pub fn from_state_dict(source: impl Into<String>, state: StateDict) -> Self {
        Self::new(source, state)
    }

    /// Attach file-level metadata.
    pub fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Identity used in diagnostics.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Root object.
    pub fn root(&self) -> &CheckpointValue {
        &self.root
    }

    /// File-level string metadata.
    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }
}
