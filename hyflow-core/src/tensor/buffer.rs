//! Allocator-owned tensor storage.

use crate::device::{Allocator, MemoryBlock, StorageType};
use crate::error::Result;
use std::fmt;
use std::sync::Arc;

/// Exclusively owns one memory block and returns it to its allocator on drop.
pub struct TensorBuffer {
    block: Option<MemoryBlock>,
    allocator: Arc<dyn Allocator>,
}

impl TensorBuffer {
    /// Allocate a zeroed buffer.
    pub fn allocate(allocator: Arc<dyn Allocator>, size: usize, storage: StorageType) -> Result<Self> {
        let block = allocator.allocate(size, storage)?;
        Ok(Self {
            block: Some(block),
            allocator,
        })
    }

    /// Size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.block.as_ref().map_or(0, MemoryBlock::len)
    }

    /// Whether the buffer holds zero bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Storage type of the underlying block.
    #[must_use]
    pub fn storage(&self) -> StorageType {
        self.block
            .as_ref()
            .map_or(StorageType::Host, MemoryBlock::storage)
    }

    /// Read access.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        match self.block.as_ref() {
            Some(block) => block.as_slice(),
            None => &[],
        }
    }

    /// Write access. Only reachable while the buffer is still exclusively
    /// owned by the kernel producing it.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self.block.as_mut() {
            Some(block) => block.as_mut_slice(),
            None => &mut [],
        }
    }
}

impl fmt::Debug for TensorBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorBuffer")
            .field("len", &self.len())
            .field("storage", &self.storage())
            .finish()
    }
}

impl Drop for TensorBuffer {
    fn drop(&mut self) {
        if let Some(block) = self.block.take() {
            self.allocator.free(block);
        }
    }
}
