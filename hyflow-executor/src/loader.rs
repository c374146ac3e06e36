//! Graph loading: one task per node, engines acquired from the registry.

use crate::registry::NodeExecutorRegistry;
use hyflow_core::error::{HyflowError, Result};
use hyflow_core::graph::Graph;
use hyflow_core::traits::NodeTask;
use hyflow_core::types::NodeId;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A graph whose nodes all have executable tasks.
///
/// Holds one engine reference per node; [`LoadedGraph::unload`] (or drop)
/// returns them to the registry.
pub struct LoadedGraph {
    graph: Arc<Graph>,
    tasks: Vec<Arc<dyn NodeTask>>,
    registry: Arc<NodeExecutorRegistry>,
    acquired: Vec<String>,
    unloaded: AtomicBool,
}

impl LoadedGraph {
    /// Load a task for every node of `graph`.
    ///
    /// On failure every engine acquired so far is released again.
    pub fn load(graph: Arc<Graph>, registry: Arc<NodeExecutorRegistry>) -> Result<Self> {
        let mut acquired: Vec<String> = Vec::with_capacity(graph.node_count());
        let mut tasks = Vec::with_capacity(graph.node_count());

        let result = (|| {
            for node in graph.nodes() {
                let executor = registry.acquire(&node.engine)?;
                acquired.push(node.engine.clone());
                let task = executor.load_task(node).map_err(|e| match e {
                    HyflowError::KernelLoad { .. } => e,
                    other => HyflowError::KernelLoad {
                        node: node.id,
                        op_type: node.op_type.clone(),
                        cause: other.to_string(),
                    },
                })?;
                tasks.push(task);
            }
            Ok(())
        })();

        if let Err(e) = result {
            for engine in &acquired {
                if let Err(release_err) = registry.release(engine) {
                    tracing::warn!(engine = %engine, error = %release_err, "Release after failed load");
                }
            }
            tracing::error!(graph = %graph.name(), error = %e, "Graph load failed");
            return Err(e);
        }

        tracing::info!(
            graph = %graph.name(),
            nodes = graph.node_count(),
            "Graph loaded"
        );

        Ok(Self {
            graph,
            tasks,
            registry,
            acquired,
            unloaded: AtomicBool::new(false),
        })
    }

    /// The loaded graph.
    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    /// Task of `node`.
    pub fn task(&self, node: NodeId) -> Result<&Arc<dyn NodeTask>> {
        self.tasks.get(node.index()).ok_or_else(|| HyflowError::InvalidGraph {
            cause: format!("{node} has no loaded task"),
        })
    }

    /// Return every engine reference. Idempotent.
    pub fn unload(&self) {
        if self.unloaded.swap(true, Ordering::AcqRel) {
            return;
        }
        for engine in &self.acquired {
            if let Err(e) = self.registry.release(engine) {
                tracing::warn!(engine = %engine, error = %e, "Engine release failed");
            }
        }
        tracing::debug!(graph = %self.graph.name(), "Graph unloaded");
    }

    /// Whether [`LoadedGraph::unload`] has run.
    pub fn is_unloaded(&self) -> bool {
        self.unloaded.load(Ordering::Acquire)
    }
}

impl Drop for LoadedGraph {
    fn drop(&mut self) {
        self.unload();
    }
}

impl fmt::Debug for LoadedGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedGraph")
            .field("graph", &self.graph.name())
            .field("tasks", &self.tasks.len())
            .field("unloaded", &self.is_unloaded())
            .finish()
    }
}
