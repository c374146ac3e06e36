//! One pipeline stage: its own stream, state and worker thread.

use super::subject::StageSubject;
use crate::config::ExecutorConfig;
use crate::context::ExecutionContext;
use crate::loader::LoadedGraph;
use crate::metrics::ExecutorMetrics;
use crate::registry::NodeExecutorRegistry;
use crate::scheduler::{RunOutcome, ScheduleState, SubgraphScheduler};
use crate::subgraph::SubgraphState;
use hyflow_core::device::DeviceRuntime;
use hyflow_core::error::{HyflowError, Result};
use hyflow_core::graph::Graph;
use hyflow_core::resource::ResourceRegistry;
use hyflow_core::tensor::TensorValue;
use hyflow_core::types::StageId;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Inputs of one iteration for one stage.
#[derive(Debug)]
pub struct StageTask {
    /// Loop iteration.
    pub iteration: u64,
    /// Graph inputs of the stage, in data-node order.
    pub inputs: Vec<TensorValue>,
}

/// What a stage tells the coordinator about an iteration.
#[derive(Debug)]
pub(crate) enum StageReport {
    /// The final stage produced the iteration's outputs.
    Outputs { iteration: u64, outputs: Vec<TensorValue> },
    /// A data source ran dry at `iteration`.
    EndOfSequence { stage: StageId, iteration: u64 },
    /// A stage failed.
    Failed { iteration: u64, error: HyflowError },
}

/// Counts iterations between submission to the first stage and their exit
/// from the pipeline.
#[derive(Debug, Default)]
pub(crate) struct InFlight {
    count: Mutex<usize>,
    idle: Condvar,
}

impl InFlight {
    pub(crate) fn enter(&self) {
        *self.count.lock() += 1;
    }

    pub(crate) fn leave(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    pub(crate) fn wait_idle(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.idle.wait(&mut count);
        }
    }
}

/// Wiring handed to a stage worker when the pipeline starts.
pub(crate) struct StageLinks {
    pub(crate) upstream: Option<Arc<StageSubject>>,
    pub(crate) downstream: Option<SyncSender<StageTask>>,
    pub(crate) reports: mpsc::Sender<StageReport>,
    /// Iterations at or beyond this index are dropped.
    pub(crate) cutoff: Arc<AtomicU64>,
    pub(crate) in_flight: Arc<InFlight>,
}

/// A stage of a [`super::PipelineCoordinator`].
#[derive(Debug)]
pub struct StageExecutor {
    id: StageId,
    ctx: Arc<ExecutionContext>,
    state: Arc<SubgraphState>,
    scheduler: Arc<SubgraphScheduler>,
    loaded: Arc<LoadedGraph>,
    subject: Arc<StageSubject>,
    sender: Mutex<Option<SyncSender<StageTask>>>,
    receiver: Mutex<Option<Receiver<StageTask>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl StageExecutor {
    /// Load `graph` and create the stage's context and state.
    pub fn new(
        id: StageId,
        graph: Arc<Graph>,
        registry: Arc<NodeExecutorRegistry>,
        runtime: &dyn DeviceRuntime,
        config: &ExecutorConfig,
        metrics: Option<ExecutorMetrics>,
    ) -> Result<Self> {
        let loaded = Arc::new(LoadedGraph::load(Arc::clone(&graph), registry)?);
        let ctx = Arc::new(ExecutionContext::new(
            id,
            runtime,
            Arc::new(ResourceRegistry::new()),
            config,
            metrics,
        )?);
        let state = Arc::new(SubgraphState::new(graph)?);
        let scheduler = Arc::new(SubgraphScheduler::new(
            Arc::clone(&ctx),
            Arc::clone(&state),
            Arc::clone(&loaded),
        ));
        let (tx, rx) = mpsc::sync_channel(config.stage_queue_capacity.max(1));

        Ok(Self {
            id,
            ctx,
            state,
            scheduler,
            loaded,
            subject: Arc::new(StageSubject::new(id)),
            sender: Mutex::new(Some(tx)),
            receiver: Mutex::new(Some(rx)),
            worker: Mutex::new(None),
        })
    }

    /// Stage id.
    pub fn id(&self) -> StageId {
        self.id
    }

    /// The stage's execution context.
    pub fn context(&self) -> &Arc<ExecutionContext> {
        &self.ctx
    }

    /// The stage's subgraph state.
    pub fn state(&self) -> &Arc<SubgraphState> {
        &self.state
    }

    /// The stage's subject.
    pub fn subject(&self) -> &Arc<StageSubject> {
        &self.subject
    }

    /// State of the stage's most recent run.
    pub fn schedule_state(&self) -> ScheduleState {
        self.scheduler.schedule_state()
    }

    /// A new handle to the stage's task queue.
    pub(crate) fn sender(&self) -> Result<SyncSender<StageTask>> {
        self.sender.lock().clone().ok_or_else(|| self.closed())
    }

    /// Queue a task, blocking while the queue is full.
    pub fn submit(&self, task: StageTask) -> Result<()> {
        self.sender()?.send(task).map_err(|_| self.closed())
    }

    fn closed(&self) -> HyflowError {
        HyflowError::QueueClosed {
            queue: format!("{} tasks", self.id),
        }
    }

    /// Spawn the worker thread.
    pub(crate) fn start(&self, links: StageLinks) -> Result<()> {
        let rx = self.receiver.lock().take().ok_or_else(|| HyflowError::InvalidState {
            component: self.id.to_string(),
            cause: "stage already started".to_string(),
        })?;
        let worker = StageWorker {
            id: self.id,
            ctx: Arc::clone(&self.ctx),
            state: Arc::clone(&self.state),
            scheduler: Arc::clone(&self.scheduler),
            subject: Arc::clone(&self.subject),
            links,
        };
        let handle = thread::Builder::new()
            .name(format!("hyflow-{}", self.id))
            .spawn(move || worker.run(rx))
            .map_err(|e| HyflowError::InvalidState {
                component: self.id.to_string(),
                cause: format!("failed to spawn worker: {e}"),
            })?;
        *self.worker.lock() = Some(handle);
        Ok(())
    }

    /// Close the task queue and join the worker once it has drained.
    pub(crate) fn close(&self) {
        self.sender.lock().take();
        self.receiver.lock().take();
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                tracing::error!(stage = %self.id, "Stage worker panicked");
            }
        }
    }

    /// Tear down the stage's device objects and engine references.
    pub(crate) fn shutdown(&self) {
        self.ctx.shutdown();
        self.loaded.unload();
    }
}

struct StageWorker {
    id: StageId,
    ctx: Arc<ExecutionContext>,
    state: Arc<SubgraphState>,
    scheduler: Arc<SubgraphScheduler>,
    subject: Arc<StageSubject>,
    links: StageLinks,
}

impl StageWorker {
    fn run(self, rx: Receiver<StageTask>) {
        tracing::debug!(stage = %self.id, "Stage worker started");
        for task in rx {
            self.process(task);
        }
        tracing::debug!(stage = %self.id, "Stage worker stopped");
    }

    fn release_upstream(&self) {
        if let Some(upstream) = &self.links.upstream {
            upstream.release();
        }
    }

    fn report(&self, report: StageReport) {
        if self.links.reports.send(report).is_err() {
            tracing::warn!(stage = %self.id, "Coordinator is gone; report dropped");
        }
    }

    fn cut_off(&self, iteration: u64) {
        self.links.cutoff.fetch_min(iteration, Ordering::AcqRel);
    }

    fn process(&self, task: StageTask) {
        let iteration = task.iteration;
        if iteration >= self.links.cutoff.load(Ordering::Acquire) {
            tracing::trace!(stage = %self.id, iteration, "Iteration dropped after cutoff");
            self.release_upstream();
            self.links.in_flight.leave();
            return;
        }
        if let Err(e) = self.subject.await_release() {
            tracing::debug!(stage = %self.id, iteration, error = %e, "Stage aborted while waiting");
            self.cut_off(iteration);
            self.release_upstream();
            self.links.in_flight.leave();
            return;
        }

        self.ctx.begin_iteration(iteration);
        self.state.reset();
        let bound = self.state.bind_inputs(task.inputs);
        self.release_upstream();

        let outcome = bound.and_then(|()| self.scheduler.run());
        if self.links.downstream.is_none() {
            self.subject.release();
        }

        match outcome {
            Ok(RunOutcome::Completed) => match self.state.get_outputs() {
                Ok(outputs) => self.forward(iteration, outputs),
                Err(e) => self.fail(iteration, e),
            },
            Ok(RunOutcome::EndOfSequence) => {
                tracing::info!(stage = %self.id, iteration, "End of sequence");
                self.cut_off(iteration);
                self.report(StageReport::EndOfSequence {
                    stage: self.id,
                    iteration,
                });
                self.links.in_flight.leave();
            }
            Err(e) => self.fail(iteration, e),
        }
    }

    fn forward(&self, iteration: u64, outputs: Vec<TensorValue>) {
        match &self.links.downstream {
            Some(next) => {
                if next.send(StageTask { iteration, inputs: outputs }).is_err() {
                    self.fail(
                        iteration,
                        HyflowError::QueueClosed {
                            queue: "next stage tasks".to_string(),
                        },
                    );
                }
            }
            None => {
                self.report(StageReport::Outputs { iteration, outputs });
                self.links.in_flight.leave();
            }
        }
    }

    fn fail(&self, iteration: u64, error: HyflowError) {
        tracing::error!(stage = %self.id, iteration, error = %error, "Stage failed");
        self.cut_off(iteration);
        self.report(StageReport::Failed {
            iteration,
            error: HyflowError::StageFailed {
                stage: self.id,
                iteration,
                cause: Box::new(error),
            },
        });
        self.links.in_flight.leave();
    }
}
