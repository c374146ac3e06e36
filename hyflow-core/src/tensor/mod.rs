//! Tensor values flowing along graph edges.
//!
//! A [`TensorValue`] is a descriptor plus one of: nothing, a runtime-owned
//! [`TensorBuffer`], or an external byte reference the runtime never frees.
//! Owned buffers are shared behind an `Arc` once their producer completes, so
//! handing the same output to several consumers never copies and the block
//! is returned to its allocator exactly once.

mod buffer;

pub use buffer::TensorBuffer;

use crate::error::{HyflowError, Result};
use byteorder::{ByteOrder, LittleEndian};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::device::StorageType;

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// 32-bit float.
    F32,
    /// 64-bit float.
    F64,
    /// 32-bit signed integer.
    I32,
    /// 64-bit signed integer.
    I64,
    /// Unsigned byte.
    U8,
    /// Boolean stored as one byte.
    Bool,
}

impl DataType {
    /// Size of one element in bytes.
    #[must_use]
    pub const fn size(&self) -> usize {
        match self {
            Self::F64 | Self::I64 => 8,
            Self::F32 | Self::I32 => 4,
            Self::U8 | Self::Bool => 1,
        }
    }
}

/// Type, shape and placement of a tensor. A dimension of `-1` is dynamic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorDesc {
    /// Element type.
    pub dtype: DataType,
    /// Dimensions; `-1` marks a dimension only known after shape inference.
    pub shape: Vec<i64>,
    /// Where buffers for this tensor are allocated.
    #[serde(default)]
    pub storage: StorageType,
}

impl TensorDesc {
    /// Create a host descriptor.
    #[must_use]
    pub fn new(dtype: DataType, shape: Vec<i64>) -> Self {
        Self {
            dtype,
            shape,
            storage: StorageType::Host,
        }
    }

    /// Set the storage type.
    #[must_use]
    pub fn with_storage(mut self, storage: StorageType) -> Self {
        self.storage = storage;
        self
    }

    /// Whether any dimension is unknown.
    #[must_use]
    pub fn is_dynamic(&self) -> bool {
        self.shape.iter().any(|&d| d < 0)
    }

    /// Number of elements, or `None` while the shape is dynamic.
    #[must_use]
    pub fn num_elements(&self) -> Option<usize> {
        self.shape.iter().try_fold(1usize, |acc, &d| {
            usize::try_from(d).ok().and_then(|d| acc.checked_mul(d))
        })
    }

    /// Size in bytes, or `None` while the shape is dynamic.
    #[must_use]
    pub fn size_bytes(&self) -> Option<usize> {
        self.num_elements()
            .and_then(|n| n.checked_mul(self.dtype.size()))
    }
}

/// Backing storage of a [`TensorValue`].
#[derive(Debug, Clone, Default)]
pub enum TensorData {
    /// Not bound yet.
    #[default]
    Empty,
    /// Runtime-owned buffer, read-only once shared.
    Owned(Arc<TensorBuffer>),
    /// Externally managed memory; never released by the runtime.
    External(Bytes),
}

/// One tensor instance. Cloning shares the underlying storage.
#[derive(Debug, Clone)]
pub struct TensorValue {
    desc: TensorDesc,
    data: TensorData,
}

impl TensorValue {
    /// An unbound tensor.
    #[must_use]
    pub fn empty(desc: TensorDesc) -> Self {
        Self {
            desc,
            data: TensorData::Empty,
        }
    }

    /// Take ownership of a freshly written buffer.
    #[must_use]
    pub fn owned(desc: TensorDesc, buffer: TensorBuffer) -> Self {
        Self::shared(desc, Arc::new(buffer))
    }

    /// Share an existing buffer.
    #[must_use]
    pub fn shared(desc: TensorDesc, buffer: Arc<TensorBuffer>) -> Self {
        Self {
            desc,
            data: TensorData::Owned(buffer),
        }
    }

    /// Reference external memory.
    #[must_use]
    pub fn external(desc: TensorDesc, bytes: Bytes) -> Self {
        Self {
            desc,
            data: TensorData::External(bytes),
        }
    }

    /// Build an external `f32` tensor, checking the element count.
    pub fn from_f32(shape: Vec<i64>, values: &[f32]) -> Result<Self> {
        let desc = TensorDesc::new(DataType::F32, shape);
        if desc.num_elements() != Some(values.len()) {
            return Err(HyflowError::TensorAccess {
                cause: format!(
                    "shape {:?} does not hold {} elements",
                    desc.shape,
                    values.len()
                ),
            });
        }
        let mut raw = vec![0u8; values.len() * DataType::F32.size()];
        LittleEndian::write_f32_into(values, &mut raw);
        Ok(Self::external(desc, Bytes::from(raw)))
    }

    /// Decode the contents as little-endian `f32`.
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        if self.desc.dtype != DataType::F32 {
            return Err(HyflowError::TensorAccess {
                cause: format!("expected f32 tensor, found {:?}", self.desc.dtype),
            });
        }
        let raw = self.bytes();
        if raw.len() % DataType::F32.size() != 0 {
            return Err(HyflowError::TensorAccess {
                cause: format!("{} bytes is not a whole number of f32", raw.len()),
            });
        }
        let mut values = vec![0f32; raw.len() / DataType::F32.size()];
        LittleEndian::read_f32_into(raw, &mut values);
        Ok(values)
    }

    /// Descriptor.
    #[must_use]
    pub fn desc(&self) -> &TensorDesc {
        &self.desc
    }

    /// Backing storage.
    #[must_use]
    pub fn data(&self) -> &TensorData {
        &self.data
    }

    /// Raw contents; empty for an unbound tensor.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        match &self.data {
            TensorData::Empty => &[],
            TensorData::Owned(buffer) => buffer.as_slice(),
            TensorData::External(bytes) => bytes,
        }
    }

    /// The owned buffer, if any.
    #[must_use]
    pub fn buffer(&self) -> Option<&Arc<TensorBuffer>> {
        match &self.data {
            TensorData::Owned(buffer) => Some(buffer),
            _ => None,
        }
    }

    /// Whether no storage is bound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self.data, TensorData::Empty)
    }

    /// Whether the storage is an external reference.
    #[must_use]
    pub fn is_external(&self) -> bool {
        matches!(self.data, TensorData::External(_))
    }

    /// Replace the descriptor, keeping the storage. Used when an alias
    /// forwards an input under the output's declared descriptor.
    #[must_use]
    pub fn with_desc(mut self, desc: TensorDesc) -> Self {
        self.desc = desc;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Allocator, HostAllocator};

    #[test]
    fn dynamic_shapes_have_no_size() {
        let desc = TensorDesc::new(DataType::F32, vec![-1, 4]);
        assert!(desc.is_dynamic());
        assert_eq!(desc.num_elements(), None);
        assert_eq!(desc.size_bytes(), None);

        let desc = TensorDesc::new(DataType::I64, vec![2, 3]);
        assert_eq!(desc.size_bytes(), Some(48));
    }

    #[test]
    fn scalar_has_one_element() {
        let desc = TensorDesc::new(DataType::U8, vec![]);
        assert_eq!(desc.num_elements(), Some(1));
    }

    #[test]
    fn f32_encoding_is_little_endian() {
        let tensor = TensorValue::from_f32(vec![2], &[1.0, -2.5]).unwrap();
        assert!(tensor.is_external());
        assert_eq!(&tensor.bytes()[..4], &1.0f32.to_le_bytes());
        assert_eq!(tensor.to_f32_vec().unwrap(), vec![1.0, -2.5]);
    }

    #[test]
    fn from_f32_rejects_wrong_count() {
        let err = TensorValue::from_f32(vec![3], &[1.0]).unwrap_err();
        assert_eq!(err.code(), "E007");
    }

    #[test]
    fn shared_buffer_is_freed_once() {
        let allocator: Arc<dyn Allocator> = Arc::new(HostAllocator::new());
        let buffer = TensorBuffer::allocate(Arc::clone(&allocator), 8, StorageType::Host).unwrap();
        let tensor = TensorValue::owned(TensorDesc::new(DataType::F32, vec![2]), buffer);
        let copies: Vec<_> = (0..4).map(|_| tensor.clone()).collect();
        drop(tensor);
        assert_eq!(allocator.stats().live_blocks, 1);
        drop(copies);
        let stats = allocator.stats();
        assert_eq!(stats.live_blocks, 0);
        assert_eq!(stats.total_frees, 1);
    }

    #[test]
    fn empty_tensor_has_no_bytes() {
        let tensor = TensorValue::empty(TensorDesc::new(DataType::F32, vec![4]));
        assert!(tensor.is_empty());
        assert!(tensor.bytes().is_empty());
        assert!(tensor.to_f32_vec().unwrap().is_empty());
    }
}
