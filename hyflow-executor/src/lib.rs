//! hyflow Executor - hybrid dataflow graph execution.
//!
//! This crate runs validated [`hyflow_core::Graph`]s on device streams:
//! - Per-node completion gates with an explicit three-state lifecycle
//! - Readiness-driven subgraph scheduler with execution groups
//! - Asynchronous dispatch with a FIFO callback bridge per stream
//! - Stage pipelining that overlaps preparation with device execution
//! - A reference-counted engine registry and graph loader
//! - A model executor with a request queue and listener results
//! - Configuration, logging setup, prometheus metrics and profiling

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod callback;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod gate;
pub mod listener;
pub mod loader;
pub mod metrics;
pub mod model;
pub mod observability;
pub mod pipeline;
pub mod profiling;
pub mod registry;
pub mod scheduler;
pub mod subgraph;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::callback::{BridgeCallback, CallbackBridge};
    pub use crate::config::ExecutorConfig;
    pub use crate::context::{ExecutionContext, RunStatus};
    pub use crate::dispatcher::{CompletionHook, ExecutionDispatcher, PreparedTask};
    pub use crate::gate::{CompletionGate, GateOutcome, GateSet, GateState};
    pub use crate::listener::{Listener, ListenerId, ResultCode, RunRequest, RunResult};
    pub use crate::loader::LoadedGraph;
    pub use crate::metrics::ExecutorMetrics;
    pub use crate::model::ModelExecutor;
    pub use crate::observability::{init_tracing, LogFormat, TracingConfig};
    pub use crate::pipeline::{
        PipelineCoordinator, PipelineOutcome, PipelinePhase, StageExecutor, StageSubject,
        StageTask,
    };
    pub use crate::profiling::{ProfileEntry, Profiler};
    pub use crate::registry::NodeExecutorRegistry;
    pub use crate::scheduler::{RunOutcome, ScheduleState, SubgraphScheduler};
    pub use crate::subgraph::{FrameState, NodeState, SubgraphState};
}
