//! Run-wide execution state.
//!
//! One [`ExecutionContext`] exists per stage of a loaded model. It owns the
//! stage's stream and callback bridge and records the run status with
//! first-failure-wins semantics: the first failing node sets the status, and
//! later failures are only counted.

use crate::callback::CallbackBridge;
use crate::config::ExecutorConfig;
use crate::metrics::ExecutorMetrics;
use crate::profiling::Profiler;
use hyflow_core::device::{Allocator, DeviceRuntime, Stream};
use hyflow_core::error::{HyflowError, Result};
use hyflow_core::resource::ResourceRegistry;
use hyflow_core::traits::TaskContext;
use hyflow_core::types::{NodeId, RunId, StageId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Status of the current run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunStatus {
    /// The first failure, if any.
    pub error: Option<HyflowError>,
    /// The node that reported it, if it came from a node.
    pub node: Option<NodeId>,
    /// Failures reported after the first.
    pub later_failures: u64,
}

impl RunStatus {
    /// Whether the run has failed (or reached end of sequence).
    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

/// Shared state of one stage for the lifetime of a loaded model.
#[derive(Debug)]
pub struct ExecutionContext {
    stage: StageId,
    run_id: Mutex<RunId>,
    stream: Arc<dyn Stream>,
    allocator: Arc<dyn Allocator>,
    bridge: CallbackBridge,
    status: Mutex<RunStatus>,
    iteration: AtomicU64,
    end_of_sequence: AtomicBool,
    profiler: Option<Arc<Profiler>>,
    metrics: Option<ExecutorMetrics>,
    resources: Arc<ResourceRegistry>,
    sync_timeout: Duration,
}

impl ExecutionContext {
    /// Create a context with a fresh stream and bridge from `runtime`.
    pub fn new(
        stage: StageId,
        runtime: &dyn DeviceRuntime,
        resources: Arc<ResourceRegistry>,
        config: &ExecutorConfig,
        metrics: Option<ExecutorMetrics>,
    ) -> Result<Self> {
        let stream = runtime.create_stream()?;
        let bridge = CallbackBridge::new(stage.to_string(), config.event_wait_timeout())?;
        let profiler = config.enable_profiling.then(|| Arc::new(Profiler::new()));

        tracing::debug!(stage = %stage, stream = %stream.id(), "Execution context created");

        Ok(Self {
            stage,
            run_id: Mutex::new(RunId::new()),
            stream,
            allocator: runtime.allocator(),
            bridge,
            status: Mutex::new(RunStatus::default()),
            iteration: AtomicU64::new(0),
            end_of_sequence: AtomicBool::new(false),
            profiler,
            metrics,
            resources,
            sync_timeout: config.stream_sync_timeout(),
        })
    }

    /// Start a new run: new run id, clean status, iteration zero.
    pub fn begin_run(&self) -> RunId {
        let run_id = RunId::new();
        *self.run_id.lock() = run_id;
        *self.status.lock() = RunStatus::default();
        self.iteration.store(0, Ordering::Release);
        self.end_of_sequence.store(false, Ordering::Release);
        run_id
    }

    /// Adopt a run id chosen elsewhere, e.g. by the pipeline coordinator.
    pub fn begin_run_with(&self, run_id: RunId) {
        self.begin_run();
        *self.run_id.lock() = run_id;
    }

    /// Clear the status before the next iteration of the same run.
    pub fn begin_iteration(&self, iteration: u64) {
        *self.status.lock() = RunStatus::default();
        self.iteration.store(iteration, Ordering::Release);
    }

    /// Record a failure. Returns `true` if it became the run status.
    pub fn record_failure(&self, node: Option<NodeId>, error: HyflowError) -> bool {
        if error.is_end_of_sequence() {
            self.end_of_sequence.store(true, Ordering::Release);
        }
        let mut status = self.status.lock();
        if status.error.is_some() {
            status.later_failures += 1;
            tracing::debug!(
                stage = %self.stage,
                node = ?node,
                error = %error,
                "Later failure ignored; run status already set"
            );
            return false;
        }
        status.error = Some(error);
        status.node = node;
        true
    }

    /// `Ok` unless the run has failed, in which case the first failure.
    pub fn status(&self) -> Result<()> {
        match &self.status.lock().error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    /// Snapshot of the run status.
    pub fn run_status(&self) -> RunStatus {
        self.status.lock().clone()
    }

    /// Whether a failure has been recorded.
    pub fn is_failed(&self) -> bool {
        self.status.lock().is_failed()
    }

    /// Whether a node reported end of sequence in this run.
    pub fn is_end_of_sequence(&self) -> bool {
        self.end_of_sequence.load(Ordering::Acquire)
    }

    /// Wait for all work on the stream, bounded by the configured timeout.
    pub fn synchronize(&self) -> Result<()> {
        self.stream.synchronize(self.sync_timeout)
    }

    /// Upper bound for stream synchronization.
    pub fn sync_timeout(&self) -> Duration {
        self.sync_timeout
    }

    /// Context handed to kernels.
    pub fn task_context(&self) -> TaskContext {
        TaskContext {
            stream: Arc::clone(&self.stream),
            resources: Arc::clone(&self.resources),
            run_id: self.run_id(),
            stage: self.stage,
            iteration: self.iteration(),
        }
    }

    /// Destroy the bridge, then the stream.
    pub fn shutdown(&self) {
        self.bridge.destroy();
        self.stream.destroy();
        tracing::debug!(stage = %self.stage, "Execution context shut down");
    }

    /// Stage id.
    pub fn stage(&self) -> StageId {
        self.stage
    }

    /// Current run id.
    pub fn run_id(&self) -> RunId {
        *self.run_id.lock()
    }

    /// Current iteration.
    pub fn iteration(&self) -> u64 {
        self.iteration.load(Ordering::Acquire)
    }

    /// The stage's stream.
    pub fn stream(&self) -> &Arc<dyn Stream> {
        &self.stream
    }

    /// The allocator for node outputs and workspaces.
    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.allocator
    }

    /// The stage's callback bridge.
    pub fn bridge(&self) -> &CallbackBridge {
        &self.bridge
    }

    /// Profiler, when profiling is enabled.
    pub fn profiler(&self) -> Option<&Arc<Profiler>> {
        self.profiler.as_ref()
    }

    /// Metrics, when enabled.
    pub fn metrics(&self) -> Option<&ExecutorMetrics> {
        self.metrics.as_ref()
    }

    /// Resources of the loaded graph.
    pub fn resources(&self) -> &Arc<ResourceRegistry> {
        &self.resources
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyflow_core::device::HostRuntime;

    fn context() -> ExecutionContext {
        ExecutionContext::new(
            StageId::new(0),
            &HostRuntime::new(),
            Arc::new(ResourceRegistry::new()),
            &ExecutorConfig::default(),
            None,
        )
        .unwrap()
    }

    fn kernel_error(node: u32, code: u32) -> HyflowError {
        HyflowError::KernelExecution {
            node: NodeId::new(node),
            code,
            cause: "boom".to_string(),
        }
    }

    #[test]
    fn first_failure_wins() {
        let ctx = context();
        assert!(ctx.record_failure(Some(NodeId::new(1)), kernel_error(1, 11)));
        assert!(!ctx.record_failure(Some(NodeId::new(0)), kernel_error(0, 22)));

        let status = ctx.run_status();
        assert_eq!(status.node, Some(NodeId::new(1)));
        assert_eq!(status.later_failures, 1);
        assert_eq!(ctx.status().unwrap_err().kernel_code(), Some(11));
    }

    #[test]
    fn concurrent_failures_have_one_winner() {
        let ctx = Arc::new(context());
        let winners: usize = (0..8)
            .map(|i| {
                let ctx = Arc::clone(&ctx);
                std::thread::spawn(move || ctx.record_failure(None, kernel_error(i, i)))
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| usize::from(h.join().unwrap()))
            .sum();
        assert_eq!(winners, 1);
        assert_eq!(ctx.run_status().later_failures, 7);
    }

    #[test]
    fn begin_run_clears_status() {
        let ctx = context();
        let first = ctx.run_id();
        ctx.record_failure(None, HyflowError::EndOfSequence);
        assert!(ctx.is_end_of_sequence());

        let second = ctx.begin_run();
        assert_ne!(first, second);
        assert!(ctx.status().is_ok());
        assert!(!ctx.is_end_of_sequence());
        ctx.shutdown();
    }

    #[test]
    fn profiling_follows_config() {
        let ctx = ExecutionContext::new(
            StageId::new(1),
            &HostRuntime::new(),
            Arc::new(ResourceRegistry::new()),
            &ExecutorConfig::default().with_profiling(true),
            None,
        )
        .unwrap();
        assert!(ctx.profiler().is_some());
        assert_eq!(ctx.task_context().stage, StageId::new(1));
    }
}
