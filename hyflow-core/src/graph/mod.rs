//! Immutable graph description consumed by the executor.
//!
//! A [`Graph`] is produced by [`GraphBuilder`] and never changes afterwards.
//! Node ids are dense, so every per-node table in the executor is a plain
//! vector indexed by [`NodeId::index`]. Input and output tensor slots are laid
//! out contiguously per node in id order.

mod builder;
mod description;

pub use builder::GraphBuilder;
pub use description::{
    AttrValue, Edge, FrameSpec, GraphDescription, NodeSpec, OutputRef, OutputSpec,
};

use crate::error::{HyflowError, Result};
use crate::types::{FrameId, GroupId, NodeId};
use std::collections::BTreeMap;

/// Static description of one node with its slot ranges resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeDescriptor {
    /// Node id.
    pub id: NodeId,
    /// Human readable name.
    pub name: String,
    /// Operator type.
    pub op_type: String,
    /// Engine tag used to find the node's executor.
    pub engine: String,
    /// Operator attributes.
    pub attrs: BTreeMap<String, AttrValue>,
    /// First input slot.
    pub input_start: usize,
    /// Number of inputs.
    pub num_inputs: usize,
    /// First output slot.
    pub output_start: usize,
    /// Declared outputs.
    pub outputs: Vec<OutputSpec>,
    /// Execution group.
    pub group: Option<GroupId>,
    /// Owning frame.
    pub frame: FrameId,
}

impl NodeDescriptor {
    /// Number of outputs.
    #[must_use]
    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    /// Subgraph-wide input slot of input `index`.
    #[must_use]
    pub fn input_slot(&self, index: usize) -> usize {
        self.input_start + index
    }

    /// Subgraph-wide output slot of output `index`.
    #[must_use]
    pub fn output_slot(&self, index: usize) -> usize {
        self.output_start + index
    }

    /// Integer attribute.
    #[must_use]
    pub fn attr_i64(&self, key: &str) -> Option<i64> {
        match self.attrs.get(key) {
            Some(AttrValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    /// Float attribute; integers are widened.
    #[must_use]
    pub fn attr_f64(&self, key: &str) -> Option<f64> {
        match self.attrs.get(key) {
            Some(AttrValue::Float(v)) => Some(*v),
            Some(AttrValue::Int(v)) => Some(*v as f64),
            _ => None,
        }
    }

    /// String attribute.
    #[must_use]
    pub fn attr_str(&self, key: &str) -> Option<&str> {
        match self.attrs.get(key) {
            Some(AttrValue::Str(v)) => Some(v),
            _ => None,
        }
    }
}

/// Static description of one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameDescriptor {
    /// Frame id.
    pub id: FrameId,
    /// Enclosing frame; `None` only for the root.
    pub parent: Option<FrameId>,
}

/// A validated, immutable graph.
#[derive(Debug, Clone)]
pub struct Graph {
    pub(crate) name: String,
    pub(crate) nodes: Vec<NodeDescriptor>,
    pub(crate) out_edges: Vec<Vec<Edge>>,
    pub(crate) in_degree: Vec<usize>,
    pub(crate) frames: Vec<FrameDescriptor>,
    pub(crate) data_nodes: Vec<NodeId>,
    pub(crate) graph_outputs: Vec<usize>,
    pub(crate) output_collector: Option<NodeId>,
    pub(crate) dynamic: bool,
    pub(crate) execution_order: Vec<NodeId>,
    pub(crate) rank: Vec<usize>,
    pub(crate) sinks: Vec<NodeId>,
    pub(crate) total_inputs: usize,
    pub(crate) total_outputs: usize,
}

impl Graph {
    /// Parse and validate a JSON graph description.
    pub fn from_json(json: &str) -> Result<Self> {
        let desc: GraphDescription =
            serde_json::from_str(json).map_err(|e| HyflowError::InvalidGraph {
                cause: format!("malformed graph description: {e}"),
            })?;
        GraphBuilder::from_description(desc).build()
    }

    /// Graph name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// All nodes in id order.
    #[must_use]
    pub fn nodes(&self) -> &[NodeDescriptor] {
        &self.nodes
    }

    /// One node.
    pub fn node(&self, id: NodeId) -> Result<&NodeDescriptor> {
        self.nodes
            .get(id.index())
            .ok_or_else(|| HyflowError::InvalidGraph {
                cause: format!("unknown node {id}"),
            })
    }

    /// Number of nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Edges leaving `node`.
    #[must_use]
    pub fn out_edges(&self, node: NodeId) -> &[Edge] {
        match self.out_edges.get(node.index()) {
            Some(edges) => edges,
            None => &[],
        }
    }

    /// Number of edges entering `node`.
    #[must_use]
    pub fn in_degree(&self, node: NodeId) -> usize {
        self.in_degree.get(node.index()).copied().unwrap_or(0)
    }

    /// Frames in id order; index 0 is the root.
    #[must_use]
    pub fn frames(&self) -> &[FrameDescriptor] {
        &self.frames
    }

    /// Data nodes in graph-input order.
    #[must_use]
    pub fn data_nodes(&self) -> &[NodeId] {
        &self.data_nodes
    }

    /// Output slots holding the results of a static graph.
    #[must_use]
    pub fn graph_outputs(&self) -> &[usize] {
        &self.graph_outputs
    }

    /// Output collector of a dynamic graph.
    #[must_use]
    pub fn output_collector(&self) -> Option<NodeId> {
        self.output_collector
    }

    /// Whether shapes are resolved at run time.
    #[must_use]
    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    /// Deterministic topological order fixed at build time.
    #[must_use]
    pub fn execution_order(&self) -> &[NodeId] {
        &self.execution_order
    }

    /// Position of `node` in [`Graph::execution_order`].
    #[must_use]
    pub fn rank(&self, node: NodeId) -> usize {
        self.rank.get(node.index()).copied().unwrap_or(usize::MAX)
    }

    /// Nodes without consumers.
    #[must_use]
    pub fn sinks(&self) -> &[NodeId] {
        &self.sinks
    }

    /// Total number of input slots.
    #[must_use]
    pub fn total_inputs(&self) -> usize {
        self.total_inputs
    }

    /// Total number of output slots.
    #[must_use]
    pub fn total_outputs(&self) -> usize {
        self.total_outputs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{DataType, TensorDesc};

    fn f32x4() -> TensorDesc {
        TensorDesc::new(DataType::F32, vec![4])
    }

    fn unary(name: &str) -> NodeSpec {
        NodeSpec::new(name, "Abs").inputs(1).output(f32x4())
    }

    fn chain() -> GraphBuilder {
        let mut builder = GraphBuilder::new("chain");
        let x = builder.add_data("x", f32x4());
        let a = builder.add_node(unary("a"));
        let b = builder.add_node(unary("b"));
        builder.connect(x, 0, a, 0).connect(a, 0, b, 0).mark_output(b, 0);
        builder
    }

    #[test]
    fn linear_graph_layout() {
        let graph = chain().build().unwrap();
        assert_eq!(graph.node_count(), 3);
        assert_eq!(graph.total_inputs(), 3);
        assert_eq!(graph.total_outputs(), 3);
        assert_eq!(
            graph.execution_order(),
            &[NodeId::new(0), NodeId::new(1), NodeId::new(2)]
        );
        assert_eq!(graph.sinks(), &[NodeId::new(2)]);
        assert_eq!(graph.graph_outputs(), &[2]);
        assert_eq!(graph.in_degree(NodeId::new(0)), 0);
        assert_eq!(graph.node(NodeId::new(0)).unwrap().engine, "host");
    }

    #[test]
    fn diamond_order_is_deterministic() {
        let mut builder = GraphBuilder::new("diamond");
        let x = builder.add_data("x", f32x4());
        let left = builder.add_node(unary("left"));
        let right = builder.add_node(unary("right"));
        let join = builder.add_node(NodeSpec::new("join", "Add").inputs(2).output(f32x4()));
        builder
            .connect(x, 0, right, 0)
            .connect(x, 0, left, 0)
            .connect(left, 0, join, 0)
            .connect(right, 0, join, 1);

        let graph = builder.build().unwrap();
        assert_eq!(graph.execution_order(), &[x, left, right, join]);
        assert_eq!(graph.in_degree(join), 2);
        assert_eq!(graph.rank(join), 3);
    }

    #[test]
    fn cycle_detected() {
        let mut builder = GraphBuilder::new("cycle");
        let a = builder.add_node(NodeSpec::new("a", "Add").inputs(1).output(f32x4()));
        let b = builder.add_node(unary("b"));
        builder.connect(a, 0, b, 0).connect(b, 0, a, 0);
        let err = builder.build().unwrap_err();
        assert!(matches!(err, HyflowError::UncontrolledCycle { .. }));
    }

    #[test]
    fn unfed_input_rejected() {
        let mut builder = GraphBuilder::new("dangling");
        builder.add_node(unary("orphan"));
        let err = builder.build().unwrap_err();
        assert!(err.to_string().contains("no producer"));
    }

    #[test]
    fn double_producer_rejected() {
        let mut builder = chain();
        builder.connect(NodeId::new(0), 0, NodeId::new(2), 0);
        assert!(builder.build().is_err());
    }

    #[test]
    fn frame_parent_must_exist() {
        let mut builder = chain();
        let inner = builder.add_frame(FrameId::ROOT);
        assert_eq!(inner, FrameId::new(1));
        assert!(builder.build().is_ok());

        let mut desc = chain().description().clone();
        desc.frames.push(FrameSpec {
            parent: FrameId::new(5),
        });
        let err = GraphBuilder::from_description(desc).build().unwrap_err();
        assert_eq!(err.code(), "E005");
    }

    #[test]
    fn dynamic_graph_needs_collector() {
        let mut builder = GraphBuilder::new("dyn");
        let x = builder.add_data("x", TensorDesc::new(DataType::F32, vec![-1]));
        builder.set_dynamic(true);
        assert!(builder.build().is_err());
        builder.set_output_collector(x);
        assert!(builder.build().is_ok());
    }

    #[test]
    fn static_graph_rejects_dynamic_outputs() {
        let mut builder = GraphBuilder::new("static");
        builder.add_data("x", TensorDesc::new(DataType::F32, vec![-1]));
        assert!(builder.build().is_err());
    }

    #[test]
    fn loads_from_json() {
        let json = r#"{
            "name": "abs",
            "nodes": [
                {"name": "x", "op_type": "Data", "inputs": 1,
                 "outputs": [{"desc": {"dtype": "f32", "shape": [4]}, "alias_input": 0}]},
                {"name": "abs", "op_type": "Abs", "inputs": 1,
                 "outputs": [{"desc": {"dtype": "f32", "shape": [4]}}],
                 "attrs": {"scale": 2}}
            ],
            "edges": [{"src": 0, "src_output": 0, "dst": 1, "dst_input": 0}],
            "data_nodes": [0],
            "outputs": [{"node": 1, "index": 0}]
        }"#;
        let graph = Graph::from_json(json).unwrap();
        let abs = graph.node(NodeId::new(1)).unwrap();
        assert_eq!(abs.attr_i64("scale"), Some(2));
        assert_eq!(abs.attr_f64("scale"), Some(2.0));
        assert_eq!(graph.data_nodes(), &[NodeId::new(0)]);

        let err = Graph::from_json("{").unwrap_err();
        assert_eq!(err.code(), "E003");
    }
}
