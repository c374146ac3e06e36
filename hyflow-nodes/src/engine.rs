//! The `host` engine: kernels that run on host streams.

use crate::math::{self, BinaryOp, UnaryOp};
use crate::memory;
use crate::queue::{self, QueueRef};
use hyflow_core::error::{HyflowError, Result};
use hyflow_core::graph::NodeDescriptor;
use hyflow_core::tensor::TensorDesc;
use hyflow_core::traits::{DoneCallback, NodeExecutor, NodeTask, TaskContext, TaskHandle};
use hyflow_executor::registry::NodeExecutorRegistry;
use std::sync::Arc;

/// Engine tag of the host kernels.
pub const HOST_ENGINE: &str = "host";

/// Operation performed by a host task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostOp {
    /// Graph input boundary.
    Data,
    /// Graph output boundary.
    Output,
    /// Forward the input unchanged.
    Identity,
    /// Copy host memory into device storage.
    Load,
    /// Copy device memory back to host storage.
    Store,
    /// Elementwise unary arithmetic.
    Unary(UnaryOp),
    /// Elementwise binary arithmetic.
    Binary(BinaryOp),
    /// Push into a resource queue.
    Enqueue(QueueRef),
    /// Pop from a resource queue.
    Dequeue(QueueRef),
}

impl HostOp {
    /// Resolve the op of a node from its `op_type` and attributes.
    pub fn from_node(node: &NodeDescriptor) -> Result<Self> {
        let op = match node.op_type.as_str() {
            "Data" => Self::Data,
            "Output" => Self::Output,
            "Identity" => Self::Identity,
            "Load" => Self::Load,
            "Store" => Self::Store,
            "Abs" => Self::Unary(UnaryOp::Abs),
            "Neg" => Self::Unary(UnaryOp::Neg),
            "Relu" => Self::Unary(UnaryOp::Relu),
            "Add" => Self::Binary(BinaryOp::Add),
            "Mul" => Self::Binary(BinaryOp::Mul),
            "Enqueue" => Self::Enqueue(QueueRef::from_node(node)?),
            "Dequeue" => Self::Dequeue(QueueRef::from_node(node)?),
            other => {
                return Err(HyflowError::KernelLoad {
                    node: node.id,
                    op_type: other.to_string(),
                    cause: format!("not supported by the {HOST_ENGINE} engine"),
                })
            }
        };
        let expected = op.arity();
        if node.num_inputs != expected {
            return Err(HyflowError::KernelLoad {
                node: node.id,
                op_type: node.op_type.clone(),
                cause: format!("expects {expected} inputs, declared {}", node.num_inputs),
            });
        }
        if node.num_outputs() != 1 {
            return Err(HyflowError::KernelLoad {
                node: node.id,
                op_type: node.op_type.clone(),
                cause: format!("expects 1 output, declared {}", node.num_outputs()),
            });
        }
        Ok(op)
    }

    /// Number of inputs the op consumes.
    #[must_use]
    pub fn arity(&self) -> usize {
        match self {
            Self::Dequeue(_) => 0,
            Self::Binary(_) => 2,
            _ => 1,
        }
    }

    fn run(self, handle: &mut TaskHandle, ctx: &TaskContext) -> Result<()> {
        match self {
            Self::Data | Self::Output | Self::Identity | Self::Load | Self::Store => {
                memory::forward(handle)
            }
            Self::Unary(op) => math::unary(op, handle),
            Self::Binary(op) => math::binary(op, handle),
            Self::Enqueue(q) => queue::enqueue(q, &ctx.resources, handle),
            Self::Dequeue(q) => queue::dequeue(q, &ctx.resources, handle),
        }
    }
}

/// One loaded host node.
#[derive(Debug)]
pub struct HostTask {
    op: HostOp,
}

impl HostTask {
    /// The op this task runs.
    #[must_use]
    pub fn op(&self) -> HostOp {
        self.op
    }
}

impl NodeTask for HostTask {
    fn infer_shape(&self, node: &NodeDescriptor, inputs: &[TensorDesc]) -> Result<Vec<TensorDesc>> {
        match self.op {
            // Nothing to infer from: fall back to the declared output.
            HostOp::Dequeue(_) => node
                .outputs
                .iter()
                .map(|o| {
                    if o.desc.is_dynamic() {
                        Err(HyflowError::ShapeInference {
                            node: node.id,
                            cause: "Dequeue needs a static output shape".to_string(),
                        })
                    } else {
                        Ok(o.desc.clone())
                    }
                })
                .collect(),
            _ => {
                let storage = node.outputs.first().map(|o| o.desc.storage).unwrap_or_default();
                let desc = math::elementwise_shape(node.id, inputs)?;
                Ok(vec![desc.with_storage(storage)])
            }
        }
    }

    fn execute_task(&self, handle: TaskHandle, ctx: &TaskContext, done: DoneCallback) -> Result<()> {
        let op = self.op;
        let node = handle.node;
        let task_ctx = ctx.clone();
        ctx.stream.launch(Box::new(move || {
            let mut handle = handle;
            let result = op.run(&mut handle, &task_ctx).map(|()| handle);
            if let Err(e) = &result {
                if !e.is_end_of_sequence() {
                    tracing::debug!(node = %node, error = %e, "Host kernel failed");
                }
            }
            done(result);
        }))
    }
}

/// Executor for the [`HOST_ENGINE`] tag.
#[derive(Debug, Default)]
pub struct HostKernelExecutor;

impl HostKernelExecutor {
    /// Create the executor.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl NodeExecutor for HostKernelExecutor {
    fn engine(&self) -> &str {
        HOST_ENGINE
    }

    fn initialize(&self) -> Result<()> {
        tracing::debug!(engine = HOST_ENGINE, "Host kernels initialized");
        Ok(())
    }

    fn finalize(&self) -> Result<()> {
        tracing::debug!(engine = HOST_ENGINE, "Host kernels finalized");
        Ok(())
    }

    fn load_task(&self, node: &NodeDescriptor) -> Result<Arc<dyn NodeTask>> {
        Ok(Arc::new(HostTask {
            op: HostOp::from_node(node)?,
        }))
    }
}

/// Register the host kernels under [`HOST_ENGINE`].
pub fn register_host_kernels(registry: &NodeExecutorRegistry) {
    registry.register_fn(HOST_ENGINE, || {
        Ok(Arc::new(HostKernelExecutor::new()) as Arc<dyn NodeExecutor>)
    });
}
