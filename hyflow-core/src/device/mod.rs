//! Device runtime abstractions.
//!
//! The executor never talks to an accelerator directly. It creates streams,
//! records events and allocates memory through these traits, so the same
//! scheduling code runs against a real device runtime or the host emulation
//! in [`host`].

mod host;

pub use host::{HostAllocator, HostEvent, HostRuntime, HostStream};

use crate::error::Result;
use crate::types::StreamId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Where a memory block lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    /// Pageable host memory.
    #[default]
    Host,
    /// Device-resident memory.
    Device,
    /// Host memory with a 64-byte aligned footprint.
    Aligned,
}

impl StorageType {
    /// Alignment granularity of [`StorageType::Aligned`] blocks.
    pub const ALIGNMENT: usize = 64;

    /// Size actually reserved for a request of `size` bytes.
    #[must_use]
    pub fn reserved_size(&self, size: usize) -> usize {
        match self {
            Self::Aligned => size.div_ceil(Self::ALIGNMENT) * Self::ALIGNMENT,
            Self::Host | Self::Device => size,
        }
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => write!(f, "host"),
            Self::Device => write!(f, "device"),
            Self::Aligned => write!(f, "aligned"),
        }
    }
}

/// A block of memory handed out by an [`Allocator`].
///
/// A block is moved, never cloned, so it can only be returned to its
/// allocator once.
#[derive(Debug)]
pub struct MemoryBlock {
    id: u64,
    storage: StorageType,
    reserved: usize,
    data: Vec<u8>,
}

impl MemoryBlock {
    /// Create a zeroed block of `size` bytes.
    #[must_use]
    pub fn zeroed(id: u64, storage: StorageType, size: usize) -> Self {
        Self {
            id,
            storage,
            reserved: storage.reserved_size(size),
            data: vec![0; size],
        }
    }

    /// Allocator-assigned identifier.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Storage type of the block.
    #[must_use]
    pub fn storage(&self) -> StorageType {
        self.storage
    }

    /// Usable size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the block has zero usable bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bytes reserved by the allocator, including alignment padding.
    #[must_use]
    pub fn reserved(&self) -> usize {
        self.reserved
    }

    /// Read access to the block contents.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Write access to the block contents.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// Allocation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AllocatorStats {
    /// Blocks currently outstanding.
    pub live_blocks: usize,
    /// Reserved bytes currently outstanding.
    pub live_bytes: usize,
    /// Successful allocations since creation.
    pub total_allocations: u64,
    /// Frees since creation.
    pub total_frees: u64,
}

/// Memory allocator for tensor and workspace buffers.
pub trait Allocator: Send + Sync + fmt::Debug {
    /// Allocate `size` bytes of the given storage type.
    fn allocate(&self, size: usize, storage: StorageType) -> Result<MemoryBlock>;

    /// Return a block to the allocator.
    fn free(&self, block: MemoryBlock);

    /// Current counters.
    fn stats(&self) -> AllocatorStats;
}

/// Work submitted to a stream.
pub type StreamWork = Box<dyn FnOnce() + Send + 'static>;

/// A point in a stream's submission order that can be waited on.
pub trait Event: Send + Sync + fmt::Debug {
    /// Block until every piece of work submitted before the event completed.
    fn wait(&self, timeout: Duration) -> Result<()>;

    /// Non-blocking completion check.
    fn is_complete(&self) -> bool;
}

/// An in-order execution queue on a device.
pub trait Stream: Send + Sync + fmt::Debug {
    /// Stream identifier.
    fn id(&self) -> StreamId;

    /// Submit work. Returns without waiting for it to run.
    fn launch(&self, work: StreamWork) -> Result<()>;

    /// Record an event after all work submitted so far.
    fn record_event(&self) -> Result<Arc<dyn Event>>;

    /// Block until all work submitted so far has completed.
    fn synchronize(&self, timeout: Duration) -> Result<()>;

    /// Stop accepting work, finish what is queued and release the stream.
    fn destroy(&self);
}

/// Factory for streams plus the allocator that backs them.
pub trait DeviceRuntime: Send + Sync + fmt::Debug {
    /// Create a new stream.
    fn create_stream(&self) -> Result<Arc<dyn Stream>>;

    /// The allocator for this runtime.
    fn allocator(&self) -> Arc<dyn Allocator>;
}
