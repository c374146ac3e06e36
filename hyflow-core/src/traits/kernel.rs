//! Kernel plug-in interface.
//!
//! An engine is a [`NodeExecutor`] registered under a string tag. At model
//! load it hands out one [`NodeTask`] per node; at run time the dispatcher
//! allocates a [`TaskHandle`] and calls [`NodeTask::execute_task`], which must
//! return immediately after queuing work on the stream.

use crate::device::Stream;
use crate::error::{HyflowError, Result};
use crate::graph::NodeDescriptor;
use crate::resource::ResourceRegistry;
use crate::tensor::{TensorBuffer, TensorDesc, TensorValue};
use crate::types::{NodeId, RunId, StageId};
use std::fmt;
use std::sync::Arc;

/// An output slot of a task being executed.
#[derive(Debug)]
pub enum OutputTensor {
    /// A buffer allocated for the kernel to write into.
    Buffer {
        /// Descriptor after shape inference.
        desc: TensorDesc,
        /// Exclusively owned until the task completes.
        buffer: TensorBuffer,
    },
    /// Forwards an input zero-copy.
    Alias {
        /// Descriptor after shape inference.
        desc: TensorDesc,
        /// Aliased input index.
        input: usize,
    },
}

impl OutputTensor {
    /// Descriptor of the output.
    #[must_use]
    pub fn desc(&self) -> &TensorDesc {
        match self {
            Self::Buffer { desc, .. } | Self::Alias { desc, .. } => desc,
        }
    }
}

/// Everything one kernel invocation reads and writes.
#[derive(Debug)]
pub struct TaskHandle {
    /// The node being executed.
    pub node: NodeId,
    /// Input tensors, one per node input.
    pub inputs: Vec<TensorValue>,
    /// Output tensors, one per node output.
    pub outputs: Vec<OutputTensor>,
    /// Scratch buffers requested through [`NodeTask::workspace_sizes`].
    pub workspaces: Vec<TensorBuffer>,
}

impl TaskHandle {
    /// Input `index`.
    pub fn input(&self, index: usize) -> Result<&TensorValue> {
        self.inputs.get(index).ok_or_else(|| HyflowError::TensorAccess {
            cause: format!("{} has no input {index}", self.node),
        })
    }

    /// Writable bytes of output `index`. Aliased outputs are not writable.
    pub fn output_mut(&mut self, index: usize) -> Result<&mut [u8]> {
        let node = self.node;
        match self.outputs.get_mut(index) {
            Some(OutputTensor::Buffer { buffer, .. }) => Ok(buffer.as_mut_slice()),
            Some(OutputTensor::Alias { .. }) => Err(HyflowError::TensorAccess {
                cause: format!("output {index} of {node} is an alias"),
            }),
            None => Err(HyflowError::TensorAccess {
                cause: format!("{node} has no output {index}"),
            }),
        }
    }

    /// Turn the finished outputs into shareable tensor values.
    pub fn into_outputs(self) -> Result<Vec<TensorValue>> {
        let Self {
            node,
            inputs,
            outputs,
            ..
        } = self;
        outputs
            .into_iter()
            .map(|output| match output {
                OutputTensor::Buffer { desc, buffer } => Ok(TensorValue::owned(desc, buffer)),
                OutputTensor::Alias { desc, input } => inputs
                    .get(input)
                    .map(|value| value.clone().with_desc(desc))
                    .ok_or_else(|| HyflowError::TensorAccess {
                        cause: format!("{node} aliases missing input {input}"),
                    }),
            })
            .collect()
    }
}

/// Run-scoped information handed to every kernel invocation.
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Stream the kernel must queue its work on.
    pub stream: Arc<dyn Stream>,
    /// Stateful resources of the loaded graph.
    pub resources: Arc<ResourceRegistry>,
    /// Run being executed.
    pub run_id: RunId,
    /// Stage executing the node.
    pub stage: StageId,
    /// Loop iteration.
    pub iteration: u64,
}

/// Completion callback. Called exactly once with the handle on success.
pub type DoneCallback = Box<dyn FnOnce(Result<TaskHandle>) + Send + 'static>;

/// Executable form of one node.
pub trait NodeTask: Send + Sync + fmt::Debug {
    /// Compute output descriptors from input descriptors.
    ///
    /// Only called for dynamically shaped graphs. The default returns the
    /// declared outputs and fails if any of them is still dynamic.
    fn infer_shape(&self, node: &NodeDescriptor, _inputs: &[TensorDesc]) -> Result<Vec<TensorDesc>> {
        node.outputs
            .iter()
            .map(|output| {
                if output.desc.is_dynamic() {
                    Err(HyflowError::ShapeInference {
                        node: node.id,
                        cause: format!("{} cannot infer {:?}", node.op_type, output.desc.shape),
                    })
                } else {
                    Ok(output.desc.clone())
                }
            })
            .collect()
    }

    /// Scratch buffer sizes in bytes for the given output descriptors.
    fn workspace_sizes(&self, _node: &NodeDescriptor, _outputs: &[TensorDesc]) -> Vec<usize> {
        Vec::new()
    }

    /// Host-side preparation run before launch.
    fn prepare_task(&self, _handle: &mut TaskHandle, _ctx: &TaskContext) -> Result<()> {
        Ok(())
    }

    /// Queue the kernel on `ctx.stream` and return without waiting.
    ///
    /// Returning `Err` is a synchronous launch failure: `done` is dropped and
    /// must not have been called. Returning `Ok` obliges the task to call
    /// `done` exactly once.
    fn execute_task(&self, handle: TaskHandle, ctx: &TaskContext, done: DoneCallback) -> Result<()>;
}

/// An engine: a family of kernels behind one tag.
pub trait NodeExecutor: Send + Sync {
    /// The engine tag.
    fn engine(&self) -> &str;

    /// Called once before the first task is loaded.
    fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Called once after the last reference is released.
    fn finalize(&self) -> Result<()> {
        Ok(())
    }

    /// Produce the task for one node.
    fn load_task(&self, node: &NodeDescriptor) -> Result<Arc<dyn NodeTask>>;
}

/// Constructs an engine on first use.
pub type NodeExecutorFactory = Arc<dyn Fn() -> Result<Arc<dyn NodeExecutor>> + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Allocator, HostAllocator, StorageType};
    use crate::tensor::DataType;

    #[test]
    fn handle_outputs_become_tensors() {
        let allocator: Arc<dyn Allocator> = Arc::new(HostAllocator::new());
        let desc = TensorDesc::new(DataType::F32, vec![1]);
        let input = TensorValue::from_f32(vec![1], &[3.0]).unwrap();
        let buffer = TensorBuffer::allocate(Arc::clone(&allocator), 4, StorageType::Host).unwrap();

        let mut handle = TaskHandle {
            node: NodeId::new(0),
            inputs: vec![input],
            outputs: vec![
                OutputTensor::Buffer {
                    desc: desc.clone(),
                    buffer,
                },
                OutputTensor::Alias {
                    desc: desc.clone(),
                    input: 0,
                },
            ],
            workspaces: Vec::new(),
        };
        handle
            .output_mut(0)
            .unwrap()
            .copy_from_slice(&7.0f32.to_le_bytes());
        assert!(handle.output_mut(1).is_err());

        let outputs = handle.into_outputs().unwrap();
        assert_eq!(outputs[0].to_f32_vec().unwrap(), vec![7.0]);
        assert!(outputs[1].is_external());
        assert_eq!(outputs[1].to_f32_vec().unwrap(), vec![3.0]);
        drop(outputs);
        assert_eq!(allocator.stats().live_blocks, 0);
    }
}
