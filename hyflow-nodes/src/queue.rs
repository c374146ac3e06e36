//! Data-flow queue operators backed by handle-keyed resources.
//!
//! `Enqueue` pushes its input into the resource named by the `handle`
//! attribute and forwards the input. `Dequeue` pops the oldest tensor; an
//! empty resource ends the sequence.

use crate::codes;
use crate::memory;
use hyflow_core::error::{HyflowError, Result};
use hyflow_core::graph::NodeDescriptor;
use hyflow_core::resource::ResourceRegistry;
use hyflow_core::traits::TaskHandle;

/// Capacity of a resource first created by a node without `capacity`.
pub const DEFAULT_CAPACITY: usize = 16;

/// Which resource a queue node talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueRef {
    /// Resource handle.
    pub handle: i64,
    /// Capacity used if this node creates the resource.
    pub capacity: usize,
}

impl QueueRef {
    pub(crate) fn from_node(node: &NodeDescriptor) -> Result<Self> {
        let handle = node.attr_i64("handle").ok_or_else(|| HyflowError::KernelLoad {
            node: node.id,
            op_type: node.op_type.clone(),
            cause: "missing integer attribute 'handle'".to_string(),
        })?;
        let capacity = match node.attr_i64("capacity") {
            Some(c) if c > 0 => c as usize,
            Some(c) => {
                return Err(HyflowError::KernelLoad {
                    node: node.id,
                    op_type: node.op_type.clone(),
                    cause: format!("capacity must be positive, got {c}"),
                })
            }
            None => DEFAULT_CAPACITY,
        };
        Ok(Self { handle, capacity })
    }
}

pub(crate) fn enqueue(queue: QueueRef, resources: &ResourceRegistry, handle: &mut TaskHandle) -> Result<()> {
    let value = handle.input(0)?.clone();
    resources
        .get_or_create(queue.handle, queue.capacity)
        .push(value)?;
    memory::forward(handle)
}

pub(crate) fn dequeue(queue: QueueRef, resources: &ResourceRegistry, handle: &mut TaskHandle) -> Result<()> {
    let node = handle.node;
    let value = resources
        .get_or_create(queue.handle, queue.capacity)
        .pop()?;
    let out = handle.output_mut(0)?;
    if out.len() != value.bytes().len() {
        return Err(HyflowError::KernelExecution {
            node,
            code: codes::SIZE_MISMATCH,
            cause: format!(
                "dequeued {} bytes into a {} byte output",
                value.bytes().len(),
                out.len()
            ),
        });
    }
    out.copy_from_slice(value.bytes());
    Ok(())
}
