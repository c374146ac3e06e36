//! Validating graph construction.

use super::description::{Edge, FrameSpec, GraphDescription, NodeSpec, OutputRef};
use super::{FrameDescriptor, Graph, NodeDescriptor};
use crate::error::{HyflowError, Result};
use crate::tensor::TensorDesc;
use crate::types::{FrameId, NodeId};
use std::collections::BTreeSet;

fn invalid(cause: impl Into<String>) -> HyflowError {
    HyflowError::InvalidGraph {
        cause: cause.into(),
    }
}

/// Builds a [`Graph`], checking every structural invariant the executor
/// relies on.
#[derive(Debug, Clone)]
pub struct GraphBuilder {
    desc: GraphDescription,
}

impl GraphBuilder {
    /// Start an empty graph.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            desc: GraphDescription::new(name),
        }
    }

    /// Start from a deserialized description.
    #[must_use]
    pub fn from_description(desc: GraphDescription) -> Self {
        Self { desc }
    }

    /// Engine for nodes that do not name one.
    #[must_use]
    pub fn default_engine(mut self, engine: impl Into<String>) -> Self {
        self.desc.default_engine = engine.into();
        self
    }

    /// Add a node and return its id.
    pub fn add_node(&mut self, spec: NodeSpec) -> NodeId {
        let id = NodeId::new(self.desc.nodes.len() as u32);
        self.desc.nodes.push(spec);
        id
    }

    /// Add a `Data` node fed by the next graph input.
    pub fn add_data(&mut self, name: impl Into<String>, desc: TensorDesc) -> NodeId {
        let id = self.add_node(NodeSpec::new(name, "Data").inputs(1).alias_output(desc, 0));
        self.desc.data_nodes.push(id);
        id
    }

    /// Add a frame nested in `parent`.
    pub fn add_frame(&mut self, parent: FrameId) -> FrameId {
        self.desc.frames.push(FrameSpec { parent });
        FrameId::new(self.desc.frames.len() as u32)
    }

    /// Connect `src` output `src_output` to `dst` input `dst_input`.
    pub fn connect(
        &mut self,
        src: NodeId,
        src_output: usize,
        dst: NodeId,
        dst_input: usize,
    ) -> &mut Self {
        self.desc.edges.push(Edge {
            src,
            src_output,
            dst,
            dst_input,
        });
        self
    }

    /// Declare `node` output `index` a graph output.
    pub fn mark_output(&mut self, node: NodeId, index: usize) -> &mut Self {
        self.desc.outputs.push(OutputRef { node, index });
        self
    }

    /// Designate the output collector of a dynamic graph.
    pub fn set_output_collector(&mut self, node: NodeId) -> &mut Self {
        self.desc.output_collector = Some(node);
        self
    }

    /// Mark the graph as dynamically shaped.
    pub fn set_dynamic(&mut self, dynamic: bool) -> &mut Self {
        self.desc.dynamic = dynamic;
        self
    }

    /// The description built so far.
    #[must_use]
    pub fn description(&self) -> &GraphDescription {
        &self.desc
    }

    /// Validate and build.
    pub fn build(&self) -> Result<Graph> {
        let desc = &self.desc;
        if desc.nodes.is_empty() {
            return Err(invalid(format!("graph '{}' has no nodes", desc.name)));
        }

        let frames = build_frames(&desc.frames)?;
        let nodes = build_nodes(desc, frames.len())?;

        let node_count = nodes.len();
        let mut out_edges: Vec<Vec<Edge>> = vec![Vec::new(); node_count];
        let mut in_degree = vec![0usize; node_count];
        let mut fed: BTreeSet<(NodeId, usize)> = BTreeSet::new();

        for edge in &desc.edges {
            let src = nodes
                .get(edge.src.index())
                .ok_or_else(|| invalid(format!("edge from unknown node {}", edge.src)))?;
            let dst = nodes
                .get(edge.dst.index())
                .ok_or_else(|| invalid(format!("edge to unknown node {}", edge.dst)))?;
            if edge.src_output >= src.num_outputs() {
                return Err(invalid(format!(
                    "{} has no output {}",
                    edge.src, edge.src_output
                )));
            }
            if edge.dst_input >= dst.num_inputs {
                return Err(invalid(format!("{} has no input {}", edge.dst, edge.dst_input)));
            }
            if !fed.insert((edge.dst, edge.dst_input)) {
                return Err(invalid(format!(
                    "input {} of {} has more than one producer",
                    edge.dst_input, edge.dst
                )));
            }
            out_edges[edge.src.index()].push(*edge);
            in_degree[edge.dst.index()] += 1;
        }

        let mut data_seen = BTreeSet::new();
        for &data in &desc.data_nodes {
            let node = nodes
                .get(data.index())
                .ok_or_else(|| invalid(format!("unknown data node {data}")))?;
            if node.num_inputs != 1 || in_degree[data.index()] != 0 {
                return Err(invalid(format!(
                    "data node {data} must have exactly one unconnected input"
                )));
            }
            if !data_seen.insert(data) {
                return Err(invalid(format!("data node {data} listed twice")));
            }
        }

        for node in &nodes {
            if data_seen.contains(&node.id) {
                continue;
            }
            for input in 0..node.num_inputs {
                if !fed.contains(&(node.id, input)) {
                    return Err(invalid(format!(
                        "input {input} of {} ({}) has no producer",
                        node.id, node.name
                    )));
                }
            }
        }

        let mut graph_outputs = Vec::with_capacity(desc.outputs.len());
        for output in &desc.outputs {
            let node = nodes
                .get(output.node.index())
                .ok_or_else(|| invalid(format!("graph output names unknown node {}", output.node)))?;
            if output.index >= node.num_outputs() {
                return Err(invalid(format!(
                    "graph output names missing output {} of {}",
                    output.index, output.node
                )));
            }
            graph_outputs.push(node.output_slot(output.index));
        }

        if let Some(collector) = desc.output_collector {
            if collector.index() >= node_count {
                return Err(invalid(format!("unknown output collector {collector}")));
            }
        }
        if desc.dynamic {
            if desc.output_collector.is_none() {
                return Err(invalid("dynamic graph requires an output collector"));
            }
        } else if let Some(node) = nodes
            .iter()
            .find(|n| n.outputs.iter().any(|o| o.desc.is_dynamic()))
        {
            return Err(invalid(format!(
                "{} declares a dynamic output in a static graph",
                node.id
            )));
        }

        let execution_order = topological_order(&out_edges, &in_degree)?;
        let mut rank = vec![0usize; node_count];
        for (position, id) in execution_order.iter().enumerate() {
            rank[id.index()] = position;
        }
        let sinks = nodes
            .iter()
            .filter(|n| out_edges[n.id.index()].is_empty())
            .map(|n| n.id)
            .collect();

        let total_inputs = nodes.iter().map(|n| n.num_inputs).sum();
        let total_outputs = nodes.iter().map(NodeDescriptor::num_outputs).sum();

        tracing::debug!(
            graph = %desc.name,
            nodes = node_count,
            edges = desc.edges.len(),
            dynamic = desc.dynamic,
            "Graph built"
        );

        Ok(Graph {
            name: desc.name.clone(),
            nodes,
            out_edges,
            in_degree,
            frames,
            data_nodes: desc.data_nodes.clone(),
            graph_outputs,
            output_collector: desc.output_collector,
            dynamic: desc.dynamic,
            execution_order,
            rank,
            sinks,
            total_inputs,
            total_outputs,
        })
    }
}

fn build_frames(specs: &[FrameSpec]) -> Result<Vec<FrameDescriptor>> {
    let mut frames = Vec::with_capacity(specs.len() + 1);
    frames.push(FrameDescriptor {
        id: FrameId::ROOT,
        parent: None,
    });
    for spec in specs {
        let id = FrameId::new(frames.len() as u32);
        if spec.parent.index() >= frames.len() {
            return Err(HyflowError::InvalidFrame {
                frame: id,
                cause: format!("parent {} does not exist yet", spec.parent),
            });
        }
        frames.push(FrameDescriptor {
            id,
            parent: Some(spec.parent),
        });
    }
    Ok(frames)
}

fn build_nodes(desc: &GraphDescription, frame_count: usize) -> Result<Vec<NodeDescriptor>> {
    let mut nodes = Vec::with_capacity(desc.nodes.len());
    let mut input_start = 0;
    let mut output_start = 0;

    for (index, spec) in desc.nodes.iter().enumerate() {
        let id = NodeId::new(index as u32);
        if spec.frame.index() >= frame_count {
            return Err(HyflowError::InvalidFrame {
                frame: spec.frame,
                cause: format!("referenced by {id} but never declared"),
            });
        }
        for (i, output) in spec.outputs.iter().enumerate() {
            if let Some(alias) = output.alias_input {
                if alias >= spec.inputs {
                    return Err(invalid(format!(
                        "output {i} of {id} aliases missing input {alias}"
                    )));
                }
            }
        }
        let engine = if spec.engine.is_empty() {
            desc.default_engine.clone()
        } else {
            spec.engine.clone()
        };

        nodes.push(NodeDescriptor {
            id,
            name: spec.name.clone(),
            op_type: spec.op_type.clone(),
            engine,
            attrs: spec.attrs.clone(),
            input_start,
            num_inputs: spec.inputs,
            output_start,
            outputs: spec.outputs.clone(),
            group: spec.group,
            frame: spec.frame,
        });
        input_start += spec.inputs;
        output_start += spec.outputs.len();
    }
    Ok(nodes)
}

/// Kahn's algorithm, always taking the smallest ready node id so the order is
/// deterministic.
fn topological_order(out_edges: &[Vec<Edge>], in_degree: &[usize]) -> Result<Vec<NodeId>> {
    let mut remaining = in_degree.to_vec();
    let mut ready: BTreeSet<NodeId> = remaining
        .iter()
        .enumerate()
        .filter(|&(_, &degree)| degree == 0)
        .map(|(i, _)| NodeId::new(i as u32))
        .collect();

    let mut sorted = Vec::with_capacity(remaining.len());
    while let Some(node) = ready.pop_first() {
        sorted.push(node);
        for edge in &out_edges[node.index()] {
            let degree = &mut remaining[edge.dst.index()];
            *degree -= 1;
            if *degree == 0 {
                ready.insert(edge.dst);
            }
        }
    }

    if sorted.len() != remaining.len() {
        let cyclic = remaining
            .iter()
            .enumerate()
            .filter(|&(_, &degree)| degree > 0)
            .map(|(i, _)| NodeId::new(i as u32))
            .collect();
        return Err(HyflowError::UncontrolledCycle { nodes: cyclic });
    }
    Ok(sorted)
}
