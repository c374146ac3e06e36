//! Result delivery for requests served by a started model executor.

use hyflow_core::error::HyflowError;
use hyflow_core::tensor::TensorValue;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Unique identifier for a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    /// Create a new unique listener ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ListenerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener_{}", self.0)
    }
}

/// Outcome class of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultCode {
    /// Outputs are valid.
    Success,
    /// A node or the runtime failed.
    InternalError,
    /// A data source is exhausted.
    EndOfSequence,
    /// A device wait timed out.
    Timeout,
    /// The executor stopped before the request ran.
    Aborted,
}

impl ResultCode {
    /// Classify a run error.
    pub fn from_error(error: &HyflowError) -> Self {
        let root = error.root_cause();
        if root.is_end_of_sequence() {
            Self::EndOfSequence
        } else if root.is_timeout() {
            Self::Timeout
        } else if root.is_aborted() {
            Self::Aborted
        } else {
            Self::InternalError
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "success",
            Self::InternalError => "internal_error",
            Self::EndOfSequence => "end_of_sequence",
            Self::Timeout => "timeout",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// A request queued with [`crate::model::ModelExecutor::enqueue_data`].
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Caller-chosen id echoed in the result.
    pub id: u64,
    /// Graph inputs, in data-node order.
    pub inputs: Vec<TensorValue>,
}

impl RunRequest {
    /// Create a request.
    pub fn new(id: u64, inputs: Vec<TensorValue>) -> Self {
        Self { id, inputs }
    }
}

/// What a listener receives for each request.
#[derive(Debug, Clone)]
pub struct RunResult {
    /// Id of the answered request.
    pub request_id: u64,
    /// Outcome class.
    pub code: ResultCode,
    /// Graph outputs; empty unless `code` is `Success`.
    pub outputs: Vec<TensorValue>,
    /// The failure, for every code but `Success`.
    pub error: Option<HyflowError>,
}

impl RunResult {
    /// A successful result.
    pub fn success(request_id: u64, outputs: Vec<TensorValue>) -> Self {
        Self {
            request_id,
            code: ResultCode::Success,
            outputs,
            error: None,
        }
    }

    /// A failed result, classified from `error`.
    pub fn failure(request_id: u64, error: HyflowError) -> Self {
        Self {
            request_id,
            code: ResultCode::from_error(&error),
            outputs: Vec::new(),
            error: Some(error),
        }
    }
}

/// Receives one [`RunResult`] per request, on the executor's worker thread.
#[derive(Clone)]
pub struct Listener {
    /// Unique identifier for this listener.
    pub id: ListenerId,
    callback: Arc<dyn Fn(RunResult) + Send + Sync>,
}

impl Listener {
    /// Create a new listener.
    pub fn new(callback: impl Fn(RunResult) + Send + Sync + 'static) -> Self {
        Self {
            id: ListenerId::new(),
            callback: Arc::new(callback),
        }
    }

    /// Invoke the listener's callback.
    pub fn notify(&self, result: RunResult) {
        (self.callback)(result);
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}
