//! Node dispatch: prepare a task, launch it, route its completion.
//!
//! Launching never blocks on the device. A task's `done` callback only parks
//! its result in a [`CompletionCell`]; the callback bridge picks it up once
//! the stream event recorded behind the kernel has fired. Completion then
//! propagates outputs, releases the node's gate, and finally calls the
//! scheduler's hook, in that order.

use crate::context::ExecutionContext;
use crate::loader::LoadedGraph;
use crate::profiling::ProfileEntry;
use crate::subgraph::SubgraphState;
use hyflow_core::device::StorageType;
use hyflow_core::error::{HyflowError, Result};
use hyflow_core::tensor::{TensorBuffer, TensorDesc, TensorValue};
use hyflow_core::traits::{NodeTask, OutputTensor, TaskContext, TaskHandle};
use hyflow_core::types::NodeId;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Called after a node's completion has been fully processed.
pub type CompletionHook = Arc<dyn Fn(NodeId, Result<()>) + Send + Sync>;

/// A node with inputs bound and outputs allocated, ready to launch.
pub struct PreparedTask {
    node: NodeId,
    task: Arc<dyn NodeTask>,
    handle: TaskHandle,
    task_ctx: TaskContext,
}

impl PreparedTask {
    /// The prepared node.
    pub fn node(&self) -> NodeId {
        self.node
    }
}

impl fmt::Debug for PreparedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparedTask")
            .field("node", &self.node)
            .field("inputs", &self.handle.inputs.len())
            .field("outputs", &self.handle.outputs.len())
            .finish()
    }
}

/// Holds a kernel's result between its `done` call and the bridge callback.
struct CompletionCell {
    result: Mutex<Option<Result<TaskHandle>>>,
    ready: Condvar,
}

impl CompletionCell {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            result: Mutex::new(None),
            ready: Condvar::new(),
        })
    }

    fn put(&self, result: Result<TaskHandle>) {
        let mut slot = self.result.lock();
        if slot.is_none() {
            *slot = Some(result);
            self.ready.notify_all();
        }
    }

    fn take(&self, timeout: Duration) -> Result<TaskHandle> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.result.lock();
        loop {
            if let Some(result) = slot.take() {
                return result;
            }
            if self.ready.wait_until(&mut slot, deadline).timed_out() {
                return slot.take().unwrap_or_else(|| {
                    Err(HyflowError::Timeout {
                        operation: "kernel completion".to_string(),
                        timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    })
                });
            }
        }
    }
}

/// Write side of a [`CompletionCell`]. Dropping it unused reports
/// `KernelIncomplete`, so a kernel that loses its callback cannot hang a run.
struct CellWriter {
    cell: Arc<CompletionCell>,
    node: NodeId,
    filled: bool,
}

impl CellWriter {
    fn fill(mut self, result: Result<TaskHandle>) {
        self.cell.put(result);
        self.filled = true;
    }
}

impl Drop for CellWriter {
    fn drop(&mut self) {
        if !self.filled {
            self.cell
                .put(Err(HyflowError::KernelIncomplete { node: self.node }));
        }
    }
}

/// Prepares, launches and completes nodes of one subgraph.
#[derive(Clone)]
pub struct ExecutionDispatcher {
    ctx: Arc<ExecutionContext>,
    state: Arc<SubgraphState>,
    loaded: Arc<LoadedGraph>,
}

impl ExecutionDispatcher {
    /// Create a dispatcher over one stage's context and state.
    pub fn new(
        ctx: Arc<ExecutionContext>,
        state: Arc<SubgraphState>,
        loaded: Arc<LoadedGraph>,
    ) -> Self {
        Self { ctx, state, loaded }
    }

    /// The stage context.
    pub fn context(&self) -> &Arc<ExecutionContext> {
        &self.ctx
    }

    /// The subgraph state.
    pub fn state(&self) -> &Arc<SubgraphState> {
        &self.state
    }

    /// The loaded graph.
    pub fn loaded(&self) -> &Arc<LoadedGraph> {
        &self.loaded
    }

    fn output_descs(&self, node: NodeId) -> Result<Vec<TensorDesc>> {
        let graph = self.state.graph();
        if graph.is_dynamic() {
            return self
                .state
                .node_state(node)?
                .inferred()
                .ok_or_else(|| HyflowError::ShapeInference {
                    node,
                    cause: "dispatched before shape inference".to_string(),
                });
        }
        Ok(graph
            .node(node)?
            .outputs
            .iter()
            .map(|output| output.desc.clone())
            .collect())
    }

    /// Collect inputs, allocate outputs and workspaces, and run the task's
    /// host-side preparation.
    pub fn prepare(&self, node: NodeId) -> Result<PreparedTask> {
        let desc = self.state.graph().node(node)?;
        let task = Arc::clone(self.loaded.task(node)?);

        let inputs = (0..desc.num_inputs)
            .map(|i| {
                self.state
                    .get_input(desc.input_slot(i))?
                    .ok_or(HyflowError::MissingInput {
                        node,
                        input_index: i,
                    })
            })
            .collect::<Result<Vec<TensorValue>>>()?;

        let descs = self.output_descs(node)?;
        let allocator = self.ctx.allocator();
        let outputs = desc
            .outputs
            .iter()
            .zip(&descs)
            .map(|(spec, out_desc)| match spec.alias_input {
                Some(input) => Ok(OutputTensor::Alias {
                    desc: out_desc.clone(),
                    input,
                }),
                None => {
                    let size = out_desc
                        .size_bytes()
                        .ok_or_else(|| HyflowError::ShapeInference {
                            node,
                            cause: format!("output shape {:?} is unresolved", out_desc.shape),
                        })?;
                    Ok(OutputTensor::Buffer {
                        desc: out_desc.clone(),
                        buffer: TensorBuffer::allocate(
                            Arc::clone(allocator),
                            size,
                            out_desc.storage,
                        )?,
                    })
                }
            })
            .collect::<Result<Vec<_>>>()?;

        let workspaces = task
            .workspace_sizes(desc, &descs)
            .into_iter()
            .map(|size| TensorBuffer::allocate(Arc::clone(allocator), size, StorageType::Device))
            .collect::<Result<Vec<_>>>()?;

        let mut handle = TaskHandle {
            node,
            inputs,
            outputs,
            workspaces,
        };
        let task_ctx = self.ctx.task_context();
        task.prepare_task(&mut handle, &task_ctx)?;

        Ok(PreparedTask {
            node,
            task,
            handle,
            task_ctx,
        })
    }

    /// Launch a prepared task. Every outcome, including a synchronous launch
    /// failure, reaches `hook` exactly once.
    pub fn launch(&self, prepared: PreparedTask, hook: CompletionHook) {
        let PreparedTask {
            node,
            task,
            handle,
            task_ctx,
        } = prepared;

        if let Ok(state) = self.state.node_state(node) {
            state.mark_dispatched();
        }
        if let Some(metrics) = self.ctx.metrics() {
            metrics.node_dispatched();
        }
        let dispatched_at = Instant::now();
        tracing::trace!(node = %node, stage = %self.ctx.stage(), "Launching node");

        let cell = CompletionCell::new();
        let writer = CellWriter {
            cell: Arc::clone(&cell),
            node,
            filled: false,
        };
        let done = Box::new(move |result: Result<TaskHandle>| writer.fill(result));

        if let Err(e) = task.execute_task(handle, &task_ctx, done) {
            self.complete(node, Err(e), dispatched_at, &hook);
            return;
        }

        let this = self.clone();
        let wait = self.ctx.sync_timeout();
        let registered = self.ctx.bridge().register_callback(
            self.ctx.stream().as_ref(),
            Box::new(move |event: Result<()>| {
                let result = event
                    .and_then(|()| cell.take(wait))
                    .and_then(TaskHandle::into_outputs);
                this.complete(node, result, dispatched_at, &hook);
            }),
        );
        if let Err(e) = registered {
            tracing::warn!(node = %node, error = %e, "Completion callback ran inline");
        }
    }

    /// Prepare and launch `node`. A preparation failure is reported through
    /// `hook` like any other node failure.
    pub fn dispatch(&self, node: NodeId, hook: CompletionHook) {
        match self.prepare(node) {
            Ok(prepared) => self.launch(prepared, hook),
            Err(e) => self.fail(node, e, hook),
        }
    }

    /// Report `node` as failed without launching it.
    pub fn fail(&self, node: NodeId, error: HyflowError, hook: CompletionHook) {
        self.complete(node, Err(error), Instant::now(), &hook);
    }

    fn propagate(&self, node: NodeId, outputs: Vec<TensorValue>) -> Result<()> {
        let graph = self.state.graph();
        let desc = graph.node(node)?;
        if outputs.len() != desc.num_outputs() {
            return Err(HyflowError::TensorAccess {
                cause: format!(
                    "{node} produced {} outputs, expected {}",
                    outputs.len(),
                    desc.num_outputs()
                ),
            });
        }
        for edge in graph.out_edges(node) {
            let tensor = outputs
                .get(edge.src_output)
                .cloned()
                .ok_or(HyflowError::SlotOutOfRange {
                    slot: "output",
                    index: edge.src_output,
                    limit: outputs.len(),
                })?;
            let dst = graph.node(edge.dst)?;
            self.state.set_input(dst.input_slot(edge.dst_input), tensor)?;
        }
        for (index, tensor) in outputs.into_iter().enumerate() {
            self.state.set_output(node, index, tensor)?;
        }
        Ok(())
    }

    fn complete(
        &self,
        node: NodeId,
        result: Result<Vec<TensorValue>>,
        dispatched_at: Instant,
        hook: &CompletionHook,
    ) {
        let outcome = result.and_then(|outputs| self.propagate(node, outputs));
        if let Err(e) = &outcome {
            if self.ctx.record_failure(Some(node), e.clone()) {
                tracing::warn!(node = %node, stage = %self.ctx.stage(), error = %e, "Node failed");
            }
        }
        if let Err(e) = self.state.node_done(node) {
            tracing::error!(node = %node, error = %e, "Could not release completion gate");
        }

        let completed_at = Instant::now();
        let success = outcome.is_ok();
        let op_type = self
            .state
            .graph()
            .node(node)
            .map(|d| d.op_type.as_str())
            .unwrap_or("unknown");
        if let Some(metrics) = self.ctx.metrics() {
            metrics.node_completed(
                op_type,
                completed_at.duration_since(dispatched_at).as_secs_f64(),
                success,
            );
        }
        if let Some(profiler) = self.ctx.profiler() {
            profiler.record(ProfileEntry {
                node,
                op_type: op_type.to_string(),
                stage: self.ctx.stage(),
                iteration: self.ctx.iteration(),
                dispatched_us: profiler.offset_us(dispatched_at),
                completed_us: profiler.offset_us(completed_at),
                success,
            });
        }

        hook(node, outcome);
    }
}

impl fmt::Debug for ExecutionDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionDispatcher")
            .field("stage", &self.ctx.stage())
            .field("graph", &self.state.graph().name())
            .finish()
    }
}
