//! Readiness-driven scheduler for one subgraph run.
//!
//! ## Algorithm
//!
//! 1. Seed the ready set with every node that has no producers
//! 2. Take all ready nodes as a batch, ordered by execution rank
//! 3. Dispatch the batch; grouped nodes are all prepared before any of them
//!    is launched
//! 4. Each completion counts down its consumers; the decrement that reaches
//!    zero makes a consumer ready
//! 5. Repeat until nothing is ready or in flight
//!
//! The first failure stops further dispatch. Work already in flight is
//! drained before [`SubgraphScheduler::run`] returns, so a reset after a
//! failed run never races a late callback.

use crate::context::ExecutionContext;
use crate::dispatcher::{CompletionHook, ExecutionDispatcher, PreparedTask};
use crate::instrument_run;
use crate::loader::LoadedGraph;
use crate::subgraph::SubgraphState;
use hyflow_core::error::{HyflowError, Result};
use hyflow_core::tensor::TensorDesc;
use hyflow_core::types::{GroupId, NodeId};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

/// Lifecycle of the most recent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScheduleState {
    /// No run started yet.
    #[default]
    Idle,
    /// Nodes are being dispatched.
    Running,
    /// Dispatch stopped after a failure; in-flight work is draining.
    Draining,
    /// The last run completed.
    Completed,
    /// The last run reached end of sequence.
    EndOfSequence,
    /// The last run failed.
    Failed,
}

/// Successful result of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every node completed.
    Completed,
    /// A data source is exhausted; outputs of this run are not valid.
    EndOfSequence,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: BTreeSet<(usize, NodeId)>,
    in_flight: usize,
    finished: usize,
    failed: bool,
}

enum Batch {
    Ready(Vec<NodeId>),
    Stop,
}

/// Ready set shared between the scheduler thread and completion callbacks.
#[derive(Debug, Default)]
struct ReadyQueue {
    state: Mutex<QueueState>,
    changed: Condvar,
}

impl ReadyQueue {
    fn seed(&self, nodes: impl IntoIterator<Item = (usize, NodeId)>) {
        self.state.lock().ready.extend(nodes);
    }

    /// Wait for ready nodes. Taken nodes count as in flight immediately.
    fn next_batch(&self) -> Batch {
        let mut state = self.state.lock();
        loop {
            if state.failed {
                return Batch::Stop;
            }
            if !state.ready.is_empty() {
                let batch: Vec<NodeId> = std::mem::take(&mut state.ready)
                    .into_iter()
                    .map(|(_, node)| node)
                    .collect();
                state.in_flight += batch.len();
                return Batch::Ready(batch);
            }
            if state.in_flight == 0 {
                return Batch::Stop;
            }
            self.changed.wait(&mut state);
        }
    }

    fn complete(&self, newly_ready: Vec<(usize, NodeId)>, failed: bool) {
        let mut state = self.state.lock();
        state.ready.extend(newly_ready);
        state.in_flight = state.in_flight.saturating_sub(1);
        state.finished += 1;
        state.failed |= failed;
        self.changed.notify_all();
    }

    /// Give back a taken node that will not be dispatched.
    fn abandon(&self) {
        let mut state = self.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        self.changed.notify_all();
    }

    fn is_failed(&self) -> bool {
        self.state.lock().failed
    }

    fn drain(&self) -> usize {
        let mut state = self.state.lock();
        while state.in_flight > 0 {
            self.changed.wait(&mut state);
        }
        state.finished
    }
}

enum Unit {
    Single(NodeId),
    Group(Vec<NodeId>),
}

/// Drives one subgraph to completion on its stage.
#[derive(Debug)]
pub struct SubgraphScheduler {
    dispatcher: ExecutionDispatcher,
    state: Mutex<ScheduleState>,
}

impl SubgraphScheduler {
    /// Create a scheduler over one stage's context and state.
    pub fn new(
        ctx: Arc<ExecutionContext>,
        subgraph: Arc<SubgraphState>,
        loaded: Arc<LoadedGraph>,
    ) -> Self {
        Self {
            dispatcher: ExecutionDispatcher::new(ctx, subgraph, loaded),
            state: Mutex::new(ScheduleState::Idle),
        }
    }

    /// State of the most recent run.
    pub fn schedule_state(&self) -> ScheduleState {
        *self.state.lock()
    }

    /// The dispatcher used for every node.
    pub fn dispatcher(&self) -> &ExecutionDispatcher {
        &self.dispatcher
    }

    fn set_state(&self, state: ScheduleState) {
        *self.state.lock() = state;
    }

    /// Run every node once. Inputs must already be bound and the subgraph
    /// state reset (or initialized) for this iteration.
    pub fn run(&self) -> Result<RunOutcome> {
        let ctx = Arc::clone(self.dispatcher.context());
        let subgraph = Arc::clone(self.dispatcher.state());
        let graph = Arc::clone(subgraph.graph());
        let span = instrument_run!(graph.name(), ctx.stage(), ctx.iteration());
        let _enter = span.enter();

        if subgraph.gates().is_aborted() {
            return Err(HyflowError::InvalidState {
                component: format!("subgraph {}", graph.name()),
                cause: "gates are cancelled; init is required before the next run".to_string(),
            });
        }

        let started = Instant::now();
        self.set_state(ScheduleState::Running);

        let queue = Arc::new(ReadyQueue::default());
        queue.seed(
            graph
                .execution_order()
                .iter()
                .filter(|node| graph.in_degree(**node) == 0)
                .map(|node| (graph.rank(*node), *node)),
        );

        let hook: CompletionHook = {
            let queue = Arc::clone(&queue);
            let subgraph = Arc::clone(&subgraph);
            Arc::new(move |node: NodeId, result: Result<()>| match result {
                Ok(()) => {
                    let graph = subgraph.graph();
                    let newly_ready = graph
                        .out_edges(node)
                        .iter()
                        .filter(|edge| {
                            subgraph
                                .node_state(edge.dst)
                                .is_ok_and(|state| state.producer_done())
                        })
                        .map(|edge| (graph.rank(edge.dst), edge.dst))
                        .collect();
                    queue.complete(newly_ready, false);
                }
                Err(e) => {
                    subgraph.on_error(&e);
                    queue.complete(Vec::new(), true);
                }
            })
        };

        while let Batch::Ready(batch) = queue.next_batch() {
            self.dispatch_batch(batch, &queue, &hook);
        }

        if queue.is_failed() {
            self.set_state(ScheduleState::Draining);
        }
        let finished = queue.drain();

        let outcome = self.finish(&ctx, &subgraph, finished);
        let label = match &outcome {
            Ok(RunOutcome::Completed) => "completed",
            Ok(RunOutcome::EndOfSequence) => "end_of_sequence",
            Err(_) => "failed",
        };
        if let Some(metrics) = ctx.metrics() {
            metrics.record_run(graph.name(), label, started.elapsed().as_secs_f64());
        }
        self.set_state(match &outcome {
            Ok(RunOutcome::Completed) => ScheduleState::Completed,
            Ok(RunOutcome::EndOfSequence) => ScheduleState::EndOfSequence,
            Err(_) => ScheduleState::Failed,
        });
        tracing::debug!(
            outcome = label,
            nodes = finished,
            elapsed_us = started.elapsed().as_micros() as u64,
            "Subgraph run finished"
        );
        outcome
    }

    fn finish(
        &self,
        ctx: &ExecutionContext,
        subgraph: &SubgraphState,
        finished: usize,
    ) -> Result<RunOutcome> {
        let graph = subgraph.graph();
        if !ctx.is_failed() {
            for sink in graph.sinks() {
                if let Err(e) = subgraph.await_node(*sink) {
                    ctx.record_failure(Some(*sink), e);
                    break;
                }
            }
        }
        if let Err(e) = ctx.synchronize() {
            ctx.record_failure(None, e);
        }
        if !ctx.is_failed() && finished != graph.node_count() {
            ctx.record_failure(
                None,
                HyflowError::InvalidGraph {
                    cause: format!(
                        "run stalled after {finished} of {} nodes",
                        graph.node_count()
                    ),
                },
            );
        }

        match ctx.status() {
            Ok(()) => Ok(RunOutcome::Completed),
            Err(e) if e.is_end_of_sequence() => Ok(RunOutcome::EndOfSequence),
            Err(e) => Err(e),
        }
    }

    fn dispatch_batch(&self, batch: Vec<NodeId>, queue: &ReadyQueue, hook: &CompletionHook) {
        let graph = Arc::clone(self.dispatcher.state().graph());
        let mut units: Vec<Unit> = Vec::with_capacity(batch.len());
        let mut groups: BTreeMap<GroupId, usize> = BTreeMap::new();
        for node in batch {
            match graph.node(node).ok().and_then(|desc| desc.group) {
                Some(group) => match groups.get(&group) {
                    Some(&at) => {
                        if let Unit::Group(members) = &mut units[at] {
                            members.push(node);
                        }
                    }
                    None => {
                        groups.insert(group, units.len());
                        units.push(Unit::Group(vec![node]));
                    }
                },
                None => units.push(Unit::Single(node)),
            }
        }

        for unit in units {
            match unit {
                Unit::Single(node) => {
                    if queue.is_failed() {
                        queue.abandon();
                        continue;
                    }
                    if let Err(e) = self.infer(node) {
                        self.dispatcher.fail(node, e, Arc::clone(hook));
                        continue;
                    }
                    self.dispatcher.dispatch(node, Arc::clone(hook));
                }
                Unit::Group(members) => {
                    let mut prepared: Vec<PreparedTask> = Vec::with_capacity(members.len());
                    for node in members {
                        if queue.is_failed() {
                            queue.abandon();
                            continue;
                        }
                        match self.infer(node).and_then(|()| self.dispatcher.prepare(node)) {
                            Ok(task) => prepared.push(task),
                            Err(e) => self.dispatcher.fail(node, e, Arc::clone(hook)),
                        }
                    }
                    for task in prepared {
                        if queue.is_failed() {
                            queue.abandon();
                            continue;
                        }
                        self.dispatcher.launch(task, Arc::clone(hook));
                    }
                }
            }
        }
    }

    /// Resolve output shapes of `node` from its bound inputs. No-op for
    /// statically shaped graphs.
    fn infer(&self, node: NodeId) -> Result<()> {
        let subgraph = self.dispatcher.state();
        let graph = subgraph.graph();
        if !graph.is_dynamic() {
            return Ok(());
        }
        let desc = graph.node(node)?;
        let inputs = (0..desc.num_inputs)
            .map(|i| {
                subgraph
                    .get_input(desc.input_slot(i))?
                    .map(|tensor| tensor.desc().clone())
                    .ok_or(HyflowError::MissingInput {
                        node,
                        input_index: i,
                    })
            })
            .collect::<Result<Vec<TensorDesc>>>()?;

        let outputs = self
            .dispatcher
            .loaded()
            .task(node)?
            .infer_shape(desc, &inputs)?;
        if outputs.len() != desc.num_outputs() {
            return Err(HyflowError::ShapeInference {
                node,
                cause: format!(
                    "inferred {} outputs, node declares {}",
                    outputs.len(),
                    desc.num_outputs()
                ),
            });
        }
        if let Some(unresolved) = outputs.iter().find(|d| d.is_dynamic()) {
            return Err(HyflowError::ShapeInference {
                node,
                cause: format!("shape {:?} is still dynamic", unresolved.shape),
            });
        }
        subgraph.node_state(node)?.set_inferred(outputs);
        Ok(())
    }
}
