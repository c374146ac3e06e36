//! Serializable graph description.
//!
//! This is the wire form a compiler or a JSON file hands to the runtime. It is
//! turned into a validated [`Graph`](super::Graph) by
//! [`GraphBuilder`](super::GraphBuilder).

use crate::tensor::TensorDesc;
use crate::types::{FrameId, GroupId, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

fn default_engine() -> String {
    "host".to_string()
}

/// A node attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    /// Integer.
    Int(i64),
    /// Float.
    Float(f64),
    /// Boolean.
    Bool(bool),
    /// String.
    Str(String),
    /// Integer list.
    Ints(Vec<i64>),
}

/// Declared output of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSpec {
    /// Descriptor of the produced tensor. May be dynamic in dynamic graphs.
    pub desc: TensorDesc,
    /// When set, the output forwards this input without allocating.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias_input: Option<usize>,
}

impl OutputSpec {
    /// An output that gets its own buffer.
    #[must_use]
    pub fn new(desc: TensorDesc) -> Self {
        Self {
            desc,
            alias_input: None,
        }
    }

    /// An output that forwards input `input` zero-copy.
    #[must_use]
    pub fn alias(desc: TensorDesc, input: usize) -> Self {
        Self {
            desc,
            alias_input: Some(input),
        }
    }
}

/// Declared node. Its id is its position in [`GraphDescription::nodes`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Human readable name.
    pub name: String,
    /// Operator type, interpreted by the engine.
    pub op_type: String,
    /// Engine tag; empty means the description's default engine.
    #[serde(default)]
    pub engine: String,
    /// Number of inputs.
    #[serde(default)]
    pub inputs: usize,
    /// Declared outputs.
    #[serde(default)]
    pub outputs: Vec<OutputSpec>,
    /// Operator attributes.
    #[serde(default)]
    pub attrs: BTreeMap<String, AttrValue>,
    /// Execution group, if the node must be prepared with others.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<GroupId>,
    /// Owning frame.
    #[serde(default)]
    pub frame: FrameId,
}

impl NodeSpec {
    /// Start a node with no inputs or outputs.
    #[must_use]
    pub fn new(name: impl Into<String>, op_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op_type: op_type.into(),
            engine: String::new(),
            inputs: 0,
            outputs: Vec::new(),
            attrs: BTreeMap::new(),
            group: None,
            frame: FrameId::ROOT,
        }
    }

    /// Set the engine tag.
    #[must_use]
    pub fn engine(mut self, engine: impl Into<String>) -> Self {
        self.engine = engine.into();
        self
    }

    /// Set the number of inputs.
    #[must_use]
    pub fn inputs(mut self, count: usize) -> Self {
        self.inputs = count;
        self
    }

    /// Append an allocated output.
    #[must_use]
    pub fn output(mut self, desc: TensorDesc) -> Self {
        self.outputs.push(OutputSpec::new(desc));
        self
    }

    /// Append an output aliasing `input`.
    #[must_use]
    pub fn alias_output(mut self, desc: TensorDesc, input: usize) -> Self {
        self.outputs.push(OutputSpec::alias(desc, input));
        self
    }

    /// Set an attribute.
    #[must_use]
    pub fn attr(mut self, key: impl Into<String>, value: AttrValue) -> Self {
        self.attrs.insert(key.into(), value);
        self
    }

    /// Place the node in an execution group.
    #[must_use]
    pub fn group(mut self, group: GroupId) -> Self {
        self.group = Some(group);
        self
    }

    /// Place the node in a frame.
    #[must_use]
    pub fn frame(mut self, frame: FrameId) -> Self {
        self.frame = frame;
        self
    }
}

/// A data edge from one node output to one node input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    /// Producing node.
    pub src: NodeId,
    /// Output index on the producer.
    pub src_output: usize,
    /// Consuming node.
    pub dst: NodeId,
    /// Input index on the consumer.
    pub dst_input: usize,
}

/// A non-root frame. Its id is its position in
/// [`GraphDescription::frames`] plus one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameSpec {
    /// Enclosing frame.
    pub parent: FrameId,
}

/// Reference to one node output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRef {
    /// Producing node.
    pub node: NodeId,
    /// Output index.
    pub index: usize,
}

/// Complete serializable graph description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphDescription {
    /// Graph name.
    pub name: String,
    /// Engine used by nodes that do not name one.
    #[serde(default = "default_engine")]
    pub default_engine: String,
    /// Nodes in id order.
    pub nodes: Vec<NodeSpec>,
    /// Data edges.
    #[serde(default)]
    pub edges: Vec<Edge>,
    /// Non-root frames in id order.
    #[serde(default)]
    pub frames: Vec<FrameSpec>,
    /// Data nodes, in graph-input order.
    #[serde(default)]
    pub data_nodes: Vec<NodeId>,
    /// Graph outputs of a static graph.
    #[serde(default)]
    pub outputs: Vec<OutputRef>,
    /// Node whose inputs are the outputs of a dynamic graph.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_collector: Option<NodeId>,
    /// Whether output shapes are only known after shape inference.
    #[serde(default)]
    pub dynamic: bool,
}

impl GraphDescription {
    /// An empty description.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default_engine: default_engine(),
            nodes: Vec::new(),
            edges: Vec::new(),
            frames: Vec::new(),
            data_nodes: Vec::new(),
            outputs: Vec::new(),
            output_collector: None,
            dynamic: false,
        }
    }
}
