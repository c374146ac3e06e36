//! Tensor slots, node state and completion gates of one subgraph.
//!
//! A [`SubgraphState`] is sized once from the graph's slot layout and reused
//! for every iteration. [`SubgraphState::reset`] clears tensors in place; the
//! slot vectors are never reallocated after construction.

mod node_state;

pub use node_state::{FrameState, NodeState};

use crate::gate::GateSet;
use hyflow_core::error::{HyflowError, Result};
use hyflow_core::graph::{Graph, NodeDescriptor};
use hyflow_core::tensor::TensorValue;
use hyflow_core::types::{FrameId, NodeId};
use parking_lot::Mutex;
use std::sync::Arc;

type Slot = Mutex<Option<TensorValue>>;

/// Per-run mutable state of a graph.
#[derive(Debug)]
pub struct SubgraphState {
    graph: Arc<Graph>,
    inputs: Vec<Slot>,
    outputs: Vec<Slot>,
    nodes: Vec<NodeState>,
    frames: Vec<FrameState>,
    gates: GateSet,
}

impl SubgraphState {
    /// Size all tables from `graph`.
    pub fn new(graph: Arc<Graph>) -> Result<Self> {
        let mut frames: Vec<FrameState> = Vec::with_capacity(graph.frames().len());
        for frame in graph.frames() {
            if let Some(parent) = frame.parent {
                if parent.index() >= frames.len() {
                    return Err(HyflowError::InvalidFrame {
                        frame: frame.id,
                        cause: format!("parent {parent} does not exist"),
                    });
                }
            }
            frames.push(FrameState::new(frame.id, frame.parent));
        }

        let nodes = graph
            .nodes()
            .iter()
            .map(|node| NodeState::new(node.id, node.frame, graph.in_degree(node.id)))
            .collect();

        Ok(Self {
            inputs: (0..graph.total_inputs()).map(|_| Mutex::new(None)).collect(),
            outputs: (0..graph.total_outputs()).map(|_| Mutex::new(None)).collect(),
            gates: GateSet::new(graph.node_count()),
            nodes,
            frames,
            graph,
        })
    }

    /// The graph this state belongs to.
    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    fn slot<'a>(table: &'a [Slot], name: &'static str, index: usize) -> Result<&'a Slot> {
        table.get(index).ok_or(HyflowError::SlotOutOfRange {
            slot: name,
            index,
            limit: table.len(),
        })
    }

    /// Store a tensor in input slot `index`.
    pub fn set_input(&self, index: usize, tensor: TensorValue) -> Result<()> {
        *Self::slot(&self.inputs, "input", index)?.lock() = Some(tensor);
        Ok(())
    }

    /// Tensor in input slot `index`, if populated.
    pub fn get_input(&self, index: usize) -> Result<Option<TensorValue>> {
        Ok(Self::slot(&self.inputs, "input", index)?.lock().clone())
    }

    fn output_slot(&self, node: &NodeDescriptor, index: usize) -> Result<usize> {
        if index >= node.num_outputs() {
            return Err(HyflowError::SlotOutOfRange {
                slot: "output",
                index,
                limit: node.num_outputs(),
            });
        }
        Ok(node.output_slot(index))
    }

    /// Store output `index` of `node`.
    pub fn set_output(&self, node: NodeId, index: usize, tensor: TensorValue) -> Result<()> {
        let slot = self.output_slot(self.graph.node(node)?, index)?;
        *Self::slot(&self.outputs, "output", slot)?.lock() = Some(tensor);
        Ok(())
    }

    /// Output `index` of `node`, if produced.
    pub fn get_output(&self, node: NodeId, index: usize) -> Result<Option<TensorValue>> {
        let slot = self.output_slot(self.graph.node(node)?, index)?;
        Ok(Self::slot(&self.outputs, "output", slot)?.lock().clone())
    }

    /// Bind graph input `index` to the input of the matching data node.
    pub fn set_graph_input(&self, index: usize, tensor: TensorValue) -> Result<()> {
        let data_nodes = self.graph.data_nodes();
        let node = data_nodes.get(index).ok_or(HyflowError::SlotOutOfRange {
            slot: "graph input",
            index,
            limit: data_nodes.len(),
        })?;
        let slot = self.graph.node(*node)?.input_slot(0);
        self.set_input(slot, tensor)
    }

    /// Bind all graph inputs at once.
    pub fn bind_inputs(&self, inputs: Vec<TensorValue>) -> Result<()> {
        let expected = self.graph.data_nodes().len();
        if inputs.len() != expected {
            return Err(HyflowError::InputCount {
                expected,
                actual: inputs.len(),
            });
        }
        for (index, tensor) in inputs.into_iter().enumerate() {
            self.set_graph_input(index, tensor)?;
        }
        Ok(())
    }

    /// Results of a completed run.
    ///
    /// Static graphs read their marked output slots; dynamic graphs read the
    /// inputs of the output collector.
    pub fn get_outputs(&self) -> Result<Vec<TensorValue>> {
        let (table, slots): (&[Slot], Vec<usize>) = match self.graph.output_collector() {
            Some(collector) if self.graph.is_dynamic() => {
                let node = self.graph.node(collector)?;
                (&self.inputs, (0..node.num_inputs).map(|i| node.input_slot(i)).collect())
            }
            _ => (&self.outputs, self.graph.graph_outputs().to_vec()),
        };

        slots
            .into_iter()
            .map(|slot| {
                Self::slot(table, "output", slot)?
                    .lock()
                    .clone()
                    .ok_or_else(|| HyflowError::TensorAccess {
                        cause: format!("graph output slot {slot} was never produced"),
                    })
            })
            .collect()
    }

    /// Block until `node` completes in this run.
    pub fn await_node(&self, node: NodeId) -> Result<()> {
        self.gates.await_node(node)
    }

    /// Signal completion of `node`.
    pub fn node_done(&self, node: NodeId) -> Result<()> {
        self.gates.node_done(node)
    }

    /// Cancel every gate so no waiter stays blocked after a failure.
    pub fn on_error(&self, error: &HyflowError) {
        tracing::debug!(graph = %self.graph.name(), error = %error, "Cancelling subgraph gates");
        self.gates.cancel_all();
    }

    /// Prepare for the next iteration: clear slots, restore countdowns,
    /// advance frames and reset released gates.
    pub fn reset(&self) {
        self.clear();
        for frame in &self.frames {
            frame.advance();
        }
        self.gates.reset();
    }

    /// Prepare for a new run. Unlike [`SubgraphState::reset`] this also lifts
    /// a previous cancellation.
    pub fn init(&self) {
        self.clear();
        for frame in &self.frames {
            frame.rewind();
        }
        self.gates.rearm();
    }

    fn clear(&self) {
        for slot in self.inputs.iter().chain(&self.outputs) {
            slot.lock().take();
        }
        for node in &self.nodes {
            node.reset();
        }
    }

    /// Run state of `node`.
    pub fn node_state(&self, node: NodeId) -> Result<&NodeState> {
        self.nodes.get(node.index()).ok_or_else(|| HyflowError::InvalidGraph {
            cause: format!("unknown node {node}"),
        })
    }

    /// State of frame `id`.
    pub fn frame(&self, id: FrameId) -> Result<&FrameState> {
        self.frames.get(id.index()).ok_or_else(|| HyflowError::InvalidFrame {
            frame: id,
            cause: "no such frame".to_string(),
        })
    }

    /// Frame owning `node`.
    pub fn node_frame(&self, node: NodeId) -> Result<&FrameState> {
        self.frame(self.node_state(node)?.frame())
    }

    /// The completion gates.
    pub fn gates(&self) -> &GateSet {
        &self.gates
    }

    /// Allocated capacity of the input and output slot tables.
    pub fn slot_capacity(&self) -> (usize, usize) {
        (self.inputs.capacity(), self.outputs.capacity())
    }
}
