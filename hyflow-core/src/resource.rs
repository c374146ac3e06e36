//! Stateful resources shared by data-flow control operators.
//!
//! Resources are keyed by an integer handle, created on first reference and
//! kept for the life of the loaded graph, across iterations and runs.

use crate::error::{HyflowError, Result};
use crate::tensor::TensorValue;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// A bounded FIFO of tensors.
#[derive(Debug)]
pub struct DataFlowResource {
    handle: i64,
    capacity: usize,
    queue: Mutex<VecDeque<TensorValue>>,
}

impl DataFlowResource {
    /// Create an empty resource.
    #[must_use]
    pub fn new(handle: i64, capacity: usize) -> Self {
        Self {
            handle,
            capacity,
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Resource handle.
    #[must_use]
    pub fn handle(&self) -> i64 {
        self.handle
    }

    /// Maximum number of queued tensors.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a tensor.
    pub fn push(&self, value: TensorValue) -> Result<()> {
        let mut queue = self.queue.lock();
        if queue.len() >= self.capacity {
            return Err(HyflowError::ResourceFull {
                handle: self.handle,
                capacity: self.capacity,
            });
        }
        queue.push_back(value);
        Ok(())
    }

    /// Remove the oldest tensor. An empty resource signals end of sequence.
    pub fn pop(&self) -> Result<TensorValue> {
        self.queue
            .lock()
            .pop_front()
            .ok_or(HyflowError::EndOfSequence)
    }

    /// Number of queued tensors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Drop every queued tensor.
    pub fn clear(&self) {
        self.queue.lock().clear();
    }
}

/// All resources of one loaded graph.
#[derive(Debug, Default)]
pub struct ResourceRegistry {
    resources: Mutex<HashMap<i64, Arc<DataFlowResource>>>,
}

impl ResourceRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up `handle`, creating it with `capacity` on first reference.
    pub fn get_or_create(&self, handle: i64, capacity: usize) -> Arc<DataFlowResource> {
        let mut resources = self.resources.lock();
        Arc::clone(resources.entry(handle).or_insert_with(|| {
            tracing::debug!(handle, capacity, "Data-flow resource created");
            Arc::new(DataFlowResource::new(handle, capacity))
        }))
    }

    /// Look up `handle` without creating it.
    #[must_use]
    pub fn get(&self, handle: i64) -> Option<Arc<DataFlowResource>> {
        self.resources.lock().get(&handle).cloned()
    }

    /// Number of live resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.lock().len()
    }

    /// Whether no resource exists.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.lock().is_empty()
    }

    /// Drop every resource. Called when the graph is unloaded.
    pub fn clear_all(&self) {
        let mut resources = self.resources.lock();
        for resource in resources.values() {
            resource.clear();
        }
        resources.clear();
    }
}
