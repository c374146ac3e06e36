//! Single-graph model executor.
//!
//! A [`ModelExecutor`] owns one loaded graph with its stage context. It runs
//! either synchronously through [`ModelExecutor::execute`] or as a service:
//! after [`ModelExecutor::start`] requests queued with
//! [`ModelExecutor::enqueue_data`] are run one at a time on a worker thread
//! and answered through the listener.

use crate::config::ExecutorConfig;
use crate::context::ExecutionContext;
use crate::instrument_request;
use crate::listener::{Listener, RunRequest, RunResult};
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
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::instrument;

/// Everything needed to run the graph once; shared with the worker thread.
struct ModelCore {
    graph: Arc<Graph>,
    loaded: Arc<LoadedGraph>,
    ctx: Arc<ExecutionContext>,
    state: Arc<SubgraphState>,
    scheduler: SubgraphScheduler,
    run_lock: Mutex<()>,
    stopped: AtomicBool,
}

impl ModelCore {
    fn execute(&self, inputs: Vec<TensorValue>) -> Result<Vec<TensorValue>> {
        let _run = self.run_lock.lock();
        if self.stopped.load(Ordering::Acquire) {
            return Err(HyflowError::Aborted {
                reason: format!("model {} is stopped", self.graph.name()),
            });
        }

        let run_id = self.ctx.begin_run();
        self.state.init();
        self.state.bind_inputs(inputs)?;
        tracing::debug!(run_id = %run_id, graph = %self.graph.name(), "Run started");

        match self.scheduler.run()? {
            RunOutcome::Completed => self.state.get_outputs(),
            RunOutcome::EndOfSequence => Err(HyflowError::EndOfSequence),
        }
    }
}

#[derive(Default)]
struct QueueState {
    requests: VecDeque<RunRequest>,
    closed: bool,
}

/// Bounded request queue between callers and the worker.
struct RequestQueue {
    state: Mutex<QueueState>,
    available: Condvar,
    capacity: usize,
}

impl RequestQueue {
    fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            available: Condvar::new(),
            capacity,
        }
    }

    fn push(&self, request: RunRequest) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(HyflowError::QueueClosed {
                queue: "requests".to_string(),
            });
        }
        if state.requests.len() >= self.capacity {
            return Err(HyflowError::QueueFull {
                queue: "requests".to_string(),
                capacity: self.capacity,
            });
        }
        state.requests.push_back(request);
        self.available.notify_one();
        Ok(())
    }

    fn pop(&self) -> Option<RunRequest> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return None;
            }
            if let Some(request) = state.requests.pop_front() {
                return Some(request);
            }
            self.available.wait(&mut state);
        }
    }

    /// Close the queue and hand back whatever was still waiting.
    fn close(&self) -> Vec<RunRequest> {
        let mut state = self.state.lock();
        state.closed = true;
        self.available.notify_all();
        state.requests.drain(..).collect()
    }

    fn len(&self) -> usize {
        self.state.lock().requests.len()
    }
}

struct Service {
    queue: Arc<RequestQueue>,
    listener: Listener,
    worker: JoinHandle<()>,
}

/// Runs one graph, synchronously or as a request-serving worker.
pub struct ModelExecutor {
    config: ExecutorConfig,
    core: Arc<ModelCore>,
    metrics: Option<ExecutorMetrics>,
    service: Mutex<Option<Service>>,
}

impl ModelExecutor {
    /// Load `graph`, acquiring its engines from `registry`.
    pub fn load(
        config: ExecutorConfig,
        graph: Arc<Graph>,
        registry: Arc<NodeExecutorRegistry>,
        runtime: &dyn DeviceRuntime,
    ) -> Result<Self> {
        config.validate()?;
        let metrics = if config.enable_metrics {
            Some(ExecutorMetrics::new().map_err(|e| HyflowError::ConfigValue {
                field: "enable_metrics".to_string(),
                cause: e.to_string(),
            })?)
        } else {
            None
        };

        let loaded = Arc::new(LoadedGraph::load(Arc::clone(&graph), registry)?);
        let ctx = Arc::new(ExecutionContext::new(
            StageId::new(0),
            runtime,
            Arc::new(ResourceRegistry::new()),
            &config,
            metrics.clone(),
        )?);
        let state = Arc::new(SubgraphState::new(Arc::clone(&graph))?);
        let scheduler =
            SubgraphScheduler::new(Arc::clone(&ctx), Arc::clone(&state), Arc::clone(&loaded));

        tracing::info!(graph = %graph.name(), nodes = graph.node_count(), "Model loaded");

        Ok(Self {
            config,
            core: Arc::new(ModelCore {
                graph,
                loaded,
                ctx,
                state,
                scheduler,
                run_lock: Mutex::new(()),
                stopped: AtomicBool::new(false),
            }),
            metrics,
            service: Mutex::new(None),
        })
    }

    /// Run the graph once on `inputs`, blocking until it finishes.
    ///
    /// Calls are serialized; a started worker shares the same lock.
    #[instrument(skip_all, fields(graph = %self.core.graph.name()))]
    pub fn execute(&self, inputs: Vec<TensorValue>) -> Result<Vec<TensorValue>> {
        self.core.execute(inputs)
    }

    /// Start the request worker. Results go to `listener`.
    pub fn start(&self, listener: Listener) -> Result<()> {
        let mut service = self.service.lock();
        if service.is_some() {
            return Err(HyflowError::InvalidState {
                component: format!("model {}", self.core.graph.name()),
                cause: "already started".to_string(),
            });
        }
        if self.core.stopped.load(Ordering::Acquire) {
            return Err(HyflowError::InvalidState {
                component: format!("model {}", self.core.graph.name()),
                cause: "stopped".to_string(),
            });
        }

        let queue = Arc::new(RequestQueue::new(self.config.request_queue_capacity));
        let worker = {
            let queue = Arc::clone(&queue);
            let core = Arc::clone(&self.core);
            let listener = listener.clone();
            thread::Builder::new()
                .name(format!("hyflow-model-{}", self.core.graph.name()))
                .spawn(move || serve(&core, &queue, &listener))
                .map_err(|e| HyflowError::InvalidState {
                    component: format!("model {}", self.core.graph.name()),
                    cause: format!("failed to spawn worker: {e}"),
                })?
        };

        tracing::info!(graph = %self.core.graph.name(), listener = %listener.id, "Model worker started");
        *service = Some(Service {
            queue,
            listener,
            worker,
        });
        Ok(())
    }

    /// Queue a request for the worker. Fails with `QueueFull` instead of
    /// blocking when the queue is at capacity.
    pub fn enqueue_data(&self, request: RunRequest) -> Result<()> {
        match self.service.lock().as_ref() {
            Some(service) => service.queue.push(request),
            None => Err(HyflowError::InvalidState {
                component: format!("model {}", self.core.graph.name()),
                cause: "enqueue_data requires a started model".to_string(),
            }),
        }
    }

    /// Requests waiting for the worker.
    pub fn queued(&self) -> usize {
        self.service
            .lock()
            .as_ref()
            .map_or(0, |service| service.queue.len())
    }

    /// Whether the request worker is running.
    pub fn is_started(&self) -> bool {
        self.service.lock().is_some()
    }

    /// Stop the model. Queued requests are answered `Aborted`, the worker
    /// finishes its current request and is joined, then the stream, bridge
    /// and engine references are released. Idempotent.
    pub fn stop(&self) {
        if self.core.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let service = self.service.lock().take();
        if let Some(service) = service {
            let abandoned = service.queue.close();
            for request in abandoned {
                service.listener.notify(RunResult::failure(
                    request.id,
                    HyflowError::Aborted {
                        reason: "model stopped".to_string(),
                    },
                ));
            }
            if service.worker.join().is_err() {
                tracing::error!(graph = %self.core.graph.name(), "Model worker panicked");
            }
        }
        // Wait out a concurrent `execute`.
        drop(self.core.run_lock.lock());
        self.core.ctx.shutdown();
        self.core.loaded.unload();
        tracing::info!(graph = %self.core.graph.name(), "Model stopped");
    }

    /// The loaded graph.
    pub fn graph(&self) -> &Arc<Graph> {
        &self.core.graph
    }

    /// The model's execution context.
    pub fn context(&self) -> &Arc<ExecutionContext> {
        &self.core.ctx
    }

    /// The model's subgraph state.
    pub fn state(&self) -> &Arc<SubgraphState> {
        &self.core.state
    }

    /// State of the most recent run.
    pub fn schedule_state(&self) -> ScheduleState {
        self.core.scheduler.schedule_state()
    }

    /// Metrics, when enabled in the config.
    pub fn metrics(&self) -> Option<&ExecutorMetrics> {
        self.metrics.as_ref()
    }
}

impl Drop for ModelExecutor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for ModelExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelExecutor")
            .field("graph", &self.core.graph.name())
            .field("started", &self.is_started())
            .field("stopped", &self.core.stopped.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

fn serve(core: &ModelCore, queue: &RequestQueue, listener: &Listener) {
    while let Some(request) = queue.pop() {
        let span = instrument_request!(request.id, core.graph.name());
        let _enter = span.enter();
        let request_id = request.id;
        let result = match core.execute(request.inputs) {
            Ok(outputs) => RunResult::success(request_id, outputs),
            Err(e) => {
                tracing::warn!(request_id, error = %e, "Request failed");
                RunResult::failure(request_id, e)
            }
        };
        listener.notify(result);
    }
    tracing::debug!(graph = %core.graph.name(), "Model worker exiting");
}
