//! Per-node and per-frame run state.

use hyflow_core::tensor::TensorDesc;
use hyflow_core::types::{FrameId, NodeId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// Mutable state of one node within a subgraph run.
#[derive(Debug)]
pub struct NodeState {
    node: NodeId,
    frame: FrameId,
    in_degree: usize,
    pending: AtomicUsize,
    dispatched: AtomicBool,
    inferred: Mutex<Option<Vec<TensorDesc>>>,
}

impl NodeState {
    pub(crate) fn new(node: NodeId, frame: FrameId, in_degree: usize) -> Self {
        Self {
            node,
            frame,
            in_degree,
            pending: AtomicUsize::new(in_degree),
            dispatched: AtomicBool::new(false),
            inferred: Mutex::new(None),
        }
    }

    /// The node.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// The frame the node belongs to.
    pub fn frame(&self) -> FrameId {
        self.frame
    }

    /// Producers still outstanding in this run.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Count down one producer. Returns `true` for exactly the decrement
    /// that makes the node ready, whatever the order of arrival.
    pub fn producer_done(&self) -> bool {
        match self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(previous) => previous == 1,
            Err(_) => {
                tracing::warn!(node = %self.node, "Producer countdown underflow");
                false
            }
        }
    }

    /// Mark the node dispatched. Returns `false` if it already was.
    pub fn mark_dispatched(&self) -> bool {
        !self.dispatched.swap(true, Ordering::AcqRel)
    }

    /// Whether the node was dispatched in this run.
    pub fn is_dispatched(&self) -> bool {
        self.dispatched.load(Ordering::Acquire)
    }

    /// Store the result of shape inference.
    pub fn set_inferred(&self, outputs: Vec<TensorDesc>) {
        *self.inferred.lock() = Some(outputs);
    }

    /// Output descriptors from shape inference, if it ran.
    pub fn inferred(&self) -> Option<Vec<TensorDesc>> {
        self.inferred.lock().clone()
    }

    pub(crate) fn reset(&self) {
        self.pending.store(self.in_degree, Ordering::Release);
        self.dispatched.store(false, Ordering::Release);
        *self.inferred.lock() = None;
    }
}

/// Run state of one loop frame.
#[derive(Debug)]
pub struct FrameState {
    id: FrameId,
    parent: Option<FrameId>,
    activations: AtomicU64,
}

impl FrameState {
    pub(crate) fn new(id: FrameId, parent: Option<FrameId>) -> Self {
        Self {
            id,
            parent,
            activations: AtomicU64::new(0),
        }
    }

    /// Frame id.
    pub fn id(&self) -> FrameId {
        self.id
    }

    /// Parent frame; `None` for the root.
    pub fn parent(&self) -> Option<FrameId> {
        self.parent
    }

    /// Resets since the last init, i.e. the current iteration of the frame.
    pub fn iteration(&self) -> u64 {
        self.activations.load(Ordering::Acquire)
    }

    pub(crate) fn advance(&self) {
        self.activations.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn rewind(&self) {
        self.activations.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn exactly_one_decrement_makes_ready() {
        let state = Arc::new(NodeState::new(NodeId::new(3), FrameId::ROOT, 16));
        let ready: usize = (0..16)
            .map(|_| {
                let state = Arc::clone(&state);
                thread::spawn(move || usize::from(state.producer_done()))
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .sum();
        assert_eq!(ready, 1);
        assert_eq!(state.pending(), 0);
        assert!(!state.producer_done());
    }

    #[test]
    fn reset_restores_countdown() {
        let state = NodeState::new(NodeId::new(0), FrameId::ROOT, 2);
        state.producer_done();
        assert!(state.mark_dispatched());
        assert!(!state.mark_dispatched());
        state.reset();
        assert_eq!(state.pending(), 2);
        assert!(!state.is_dispatched());
        assert!(state.inferred().is_none());
    }
}
