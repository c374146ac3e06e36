//! Prelude for convenient imports.
//!
//! ```
//! use hyflow_core::prelude::*;
//! ```

// Identifiers
pub use crate::types::{FrameId, GroupId, NodeId, RunId, StageId, StreamId};

// Error handling
pub use crate::error::{HyflowError, Result, ResultExt};

// Tensors
pub use crate::tensor::{DataType, TensorBuffer, TensorData, TensorDesc, TensorValue};

// Device runtime
pub use crate::device::{
    Allocator, AllocatorStats, DeviceRuntime, Event, HostRuntime, MemoryBlock, StorageType,
    Stream, StreamWork,
};

// Graph
pub use crate::graph::{
    AttrValue, Edge, FrameDescriptor, Graph, GraphBuilder, GraphDescription, NodeDescriptor,
    NodeSpec, OutputSpec,
};

// Kernels and resources
pub use crate::resource::{DataFlowResource, ResourceRegistry};
pub use crate::traits::{
    DoneCallback, NodeExecutor, NodeExecutorFactory, NodeTask, OutputTensor, TaskContext,
    TaskHandle,
};
