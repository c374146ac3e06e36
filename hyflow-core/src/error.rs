//! Error types for hyflow.
//!
//! Every failure carries a stable code (e.g. `E103`) and the identifiers
//! needed to locate it (node, stage, stream). Errors are `Clone` because a
//! single run failure is reported to every waiter of that run.

use crate::device::StorageType;
use crate::types::{FrameId, NodeId, StageId, StreamId};
use thiserror::Error;

/// The main error type for hyflow operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HyflowError {
    // =========================================================================
    // Contract violations (E001-E099)
    // =========================================================================
    /// A tensor slot index is outside the statically computed slot range.
    #[error("E001: {slot} slot index {index} out of range (total {limit})")]
    SlotOutOfRange {
        /// Which slot table was addressed ("input" or "output").
        slot: &'static str,
        /// The offending index.
        index: usize,
        /// The number of slots in the table.
        limit: usize,
    },

    /// A node was dispatched with an unpopulated input slot.
    #[error("E002: Node {node} dispatched with missing input {input_index}")]
    MissingInput {
        /// The node being dispatched.
        node: NodeId,
        /// Index of the missing input within the node.
        input_index: usize,
    },

    /// The graph description is malformed.
    #[error("E003: Invalid graph: {cause}")]
    InvalidGraph {
        /// Description of the problem.
        cause: String,
    },

    /// The graph contains a cycle.
    #[error("E004: Cycle detected involving nodes: {nodes:?}")]
    UncontrolledCycle {
        /// Nodes that could not be ordered.
        nodes: Vec<NodeId>,
    },

    /// A frame was declared or referenced inconsistently.
    #[error("E005: Invalid frame {frame}: {cause}")]
    InvalidFrame {
        /// The frame involved.
        frame: FrameId,
        /// Description of the problem.
        cause: String,
    },

    /// The caller supplied the wrong number of graph inputs.
    #[error("E006: Expected {expected} graph inputs, got {actual}")]
    InputCount {
        /// Number of data nodes in the graph.
        expected: usize,
        /// Number of tensors supplied.
        actual: usize,
    },

    /// A tensor was accessed in a way its descriptor does not allow.
    #[error("E007: Tensor access failed: {cause}")]
    TensorAccess {
        /// Description of the problem.
        cause: String,
    },

    // =========================================================================
    // Kernel errors (E100-E199)
    // =========================================================================
    /// No executor is registered for an engine tag.
    #[error("E101: No node executor registered for engine '{engine}'")]
    EngineNotFound {
        /// The engine tag that was looked up.
        engine: String,
    },

    /// The engine could not produce a task for a node.
    #[error("E102: Failed to load task for node {node} ({op_type}): {cause}")]
    KernelLoad {
        /// The node being loaded.
        node: NodeId,
        /// The node's operator type.
        op_type: String,
        /// Reason for the failure.
        cause: String,
    },

    /// A kernel reported a failure while executing.
    #[error("E103: Kernel for node {node} failed with code {code}: {cause}")]
    KernelExecution {
        /// The failing node.
        node: NodeId,
        /// Kernel-specific error code.
        code: u32,
        /// Reason for the failure.
        cause: String,
    },

    /// Shape inference failed for a node.
    #[error("E104: Shape inference failed for node {node}: {cause}")]
    ShapeInference {
        /// The node whose shapes could not be inferred.
        node: NodeId,
        /// Reason for the failure.
        cause: String,
    },

    /// A kernel's stream work finished without reporting a result.
    #[error("E105: Kernel for node {node} completed without reporting a result")]
    KernelIncomplete {
        /// The node whose kernel stayed silent.
        node: NodeId,
    },

    // =========================================================================
    // Device errors (E200-E299)
    // =========================================================================
    /// Memory allocation failed.
    #[error("E201: Failed to allocate {requested} bytes of {storage} memory: {cause}")]
    Allocation {
        /// Number of bytes requested.
        requested: usize,
        /// Storage type requested.
        storage: StorageType,
        /// Reason for the failure.
        cause: String,
    },

    /// A stream rejected or failed a submission.
    #[error("E202: Stream {stream} failed: {cause}")]
    StreamFailure {
        /// The stream involved.
        stream: StreamId,
        /// Reason for the failure.
        cause: String,
    },

    /// A wait on the device did not finish in time.
    #[error("E203: {operation} timed out after {timeout_ms}ms")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The timeout that elapsed.
        timeout_ms: u64,
    },

    /// A stream was used after it was destroyed.
    #[error("E204: Stream {stream} has been destroyed")]
    StreamDestroyed {
        /// The destroyed stream.
        stream: StreamId,
    },

    // =========================================================================
    // Run outcomes (E300-E399)
    // =========================================================================
    /// The data source is exhausted. Terminal, but not a failure.
    #[error("E301: End of sequence")]
    EndOfSequence,

    /// A node's completion gate was cancelled while being awaited.
    #[error("E302: Node {node} was cancelled")]
    Cancelled {
        /// The awaited node.
        node: NodeId,
    },

    /// The run was aborted by a stop request.
    #[error("E303: Run aborted: {reason}")]
    Aborted {
        /// Why the run was aborted.
        reason: String,
    },

    // =========================================================================
    // Pipeline and service errors (E400-E499)
    // =========================================================================
    /// A queue was closed while sending or receiving.
    #[error("E401: Queue '{queue}' is closed")]
    QueueClosed {
        /// Name of the queue.
        queue: String,
    },

    /// A bounded queue is full.
    #[error("E402: Queue '{queue}' is full (capacity {capacity})")]
    QueueFull {
        /// Name of the queue.
        queue: String,
        /// Capacity of the queue.
        capacity: usize,
    },

    /// An operation was called in the wrong lifecycle state.
    #[error("E403: Invalid state for {component}: {cause}")]
    InvalidState {
        /// The component whose state was wrong.
        component: String,
        /// Description of the problem.
        cause: String,
    },

    /// A pipeline stage failed.
    #[error("E404: Stage {stage} failed at iteration {iteration}: {cause}")]
    StageFailed {
        /// The failing stage.
        stage: StageId,
        /// The iteration that failed.
        iteration: u64,
        /// The underlying error.
        cause: Box<HyflowError>,
    },

    // =========================================================================
    // Resource errors (E500-E599)
    // =========================================================================
    /// A data-flow resource is at capacity.
    #[error("E501: Resource {handle} is full (capacity {capacity})")]
    ResourceFull {
        /// The resource handle.
        handle: i64,
        /// Capacity of the resource.
        capacity: usize,
    },

    // =========================================================================
    // Configuration errors (E600-E699)
    // =========================================================================
    /// Invalid configuration value.
    #[error("E601: Invalid configuration value for '{field}': {cause}")]
    ConfigValue {
        /// The configuration field.
        field: String,
        /// Description of the problem.
        cause: String,
    },

    /// A configuration document could not be parsed.
    #[error("E602: Failed to parse configuration: {cause}")]
    ConfigParse {
        /// Parser message.
        cause: String,
    },
}

impl HyflowError {
    /// Get the error code (e.g., "E001").
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::SlotOutOfRange { .. } => "E001",
            Self::MissingInput { .. } => "E002",
            Self::InvalidGraph { .. } => "E003",
            Self::UncontrolledCycle { .. } => "E004",
            Self::InvalidFrame { .. } => "E005",
            Self::InputCount { .. } => "E006",
            Self::TensorAccess { .. } => "E007",
            Self::EngineNotFound { .. } => "E101",
            Self::KernelLoad { .. } => "E102",
            Self::KernelExecution { .. } => "E103",
            Self::ShapeInference { .. } => "E104",
            Self::KernelIncomplete { .. } => "E105",
            Self::Allocation { .. } => "E201",
            Self::StreamFailure { .. } => "E202",
            Self::Timeout { .. } => "E203",
            Self::StreamDestroyed { .. } => "E204",
            Self::EndOfSequence => "E301",
            Self::Cancelled { .. } => "E302",
            Self::Aborted { .. } => "E303",
            Self::QueueClosed { .. } => "E401",
            Self::QueueFull { .. } => "E402",
            Self::InvalidState { .. } => "E403",
            Self::StageFailed { .. } => "E404",
            Self::ResourceFull { .. } => "E501",
            Self::ConfigValue { .. } => "E601",
            Self::ConfigParse { .. } => "E602",
        }
    }

    /// Strip pipeline wrapping and return the error that started the failure.
    #[must_use]
    pub fn root_cause(&self) -> &HyflowError {
        match self {
            Self::StageFailed { cause, .. } => cause.root_cause(),
            other => other,
        }
    }

    /// Check if this error is a programming-contract violation.
    ///
    /// Contract violations are fatal to the current run and never retried.
    #[must_use]
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self.root_cause(),
            Self::SlotOutOfRange { .. }
                | Self::MissingInput { .. }
                | Self::InvalidGraph { .. }
                | Self::UncontrolledCycle { .. }
                | Self::InvalidFrame { .. }
                | Self::InputCount { .. }
                | Self::TensorAccess { .. }
        )
    }

    /// Check if this is the end-of-sequence signal.
    #[must_use]
    pub fn is_end_of_sequence(&self) -> bool {
        matches!(self.root_cause(), Self::EndOfSequence)
    }

    /// Check if this error is a timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self.root_cause(), Self::Timeout { .. })
    }

    /// Check if this error is an abort request.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        matches!(self.root_cause(), Self::Aborted { .. })
    }

    /// Check if the operation may succeed when simply tried again.
    ///
    /// Kernel failures are never retriable; only back-pressure is.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(self.root_cause(), Self::QueueFull { .. })
    }

    /// The kernel-specific code, if this is a kernel execution failure.
    #[must_use]
    pub fn kernel_code(&self) -> Option<u32> {
        match self.root_cause() {
            Self::KernelExecution { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Result type alias using `HyflowError`.
pub type Result<T> = std::result::Result<T, HyflowError>;

/// Extension trait for attaching node context to foreign errors.
pub trait ResultExt<T> {
    /// Turn any displayable error into a kernel failure of `node`.
    fn kernel_failure(self, node: NodeId, code: u32) -> Result<T>;

    /// Turn any displayable error into a tensor access error.
    fn tensor_access(self) -> Result<T>;
}

impl<T, E: std::fmt::Display> ResultExt<T> for std::result::Result<T, E> {
    fn kernel_failure(self, node: NodeId, code: u32) -> Result<T> {
        self.map_err(|e| HyflowError::KernelExecution {
            node,
            code,
            cause: e.to_string(),
        })
    }

    fn tensor_access(self) -> Result<T> {
        self.map_err(|e| HyflowError::TensorAccess {
            cause: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_correct() {
        let err = HyflowError::SlotOutOfRange {
            slot: "input",
            index: 9,
            limit: 4,
        };
        assert_eq!(err.code(), "E001");
        assert_eq!(HyflowError::EndOfSequence.code(), "E301");
    }

    #[test]
    fn error_display() {
        let err = HyflowError::KernelExecution {
            node: NodeId::new(5),
            code: 507_011,
            cause: "aicore trap".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("E103"));
        assert!(msg.contains("node_5"));
        assert!(msg.contains("507011"));
    }

    #[test]
    fn classification_sees_through_stage_wrapping() {
        let err = HyflowError::StageFailed {
            stage: StageId::new(1),
            iteration: 3,
            cause: Box::new(HyflowError::EndOfSequence),
        };
        assert!(err.is_end_of_sequence());
        assert!(!err.is_timeout());

        let timeout = HyflowError::Timeout {
            operation: "stream synchronize".to_string(),
            timeout_ms: 10,
        };
        assert!(timeout.is_timeout());
        assert!(!timeout.is_end_of_sequence());
        assert!(!timeout.is_aborted());
    }

    #[test]
    fn contract_violations() {
        assert!(HyflowError::MissingInput {
            node: NodeId::new(1),
            input_index: 0
        }
        .is_contract_violation());
        assert!(!HyflowError::KernelExecution {
            node: NodeId::new(1),
            code: 1,
            cause: "x".to_string()
        }
        .is_contract_violation());
    }

    #[test]
    fn kernel_code_is_exposed() {
        let failed: std::result::Result<(), &str> = Err("bad");
        let err = failed.kernel_failure(NodeId::new(2), 42).unwrap_err();
        assert_eq!(err.kernel_code(), Some(42));
        assert_eq!(HyflowError::EndOfSequence.kernel_code(), None);
    }
}
