//! Multi-stage pipelined execution.
//!
//! Each stage runs one subgraph on its own stream and worker thread. While
//! stage `k` runs iteration `i` on the device, stage `k - 1` is already
//! preparing iteration `i + 1`. Stage queues are bounded, so a slow stage
//! back-pressures the stages before it.

use super::stage::{InFlight, StageExecutor, StageLinks, StageReport, StageTask};
use crate::config::ExecutorConfig;
use crate::instrument_pipeline;
use crate::metrics::ExecutorMetrics;
use crate::registry::NodeExecutorRegistry;
use hyflow_core::device::DeviceRuntime;
use hyflow_core::error::{HyflowError, Result};
use hyflow_core::graph::Graph;
use hyflow_core::tensor::TensorValue;
use hyflow_core::types::{RunId, StageId};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;

/// Lifecycle of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelinePhase {
    /// Stages exist but no worker runs yet.
    Created,
    /// Workers are running; `execute` is accepted.
    Ready,
    /// Torn down.
    Stopped,
}

/// Result of [`PipelineCoordinator::execute`].
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    /// Outputs of the final stage, one entry per completed iteration.
    pub outputs: Vec<Vec<TensorValue>>,
    /// Whether a data source ran dry before `iteration_end`.
    pub end_of_sequence: bool,
}

/// Coordinates the stages of a pipelined model.
#[derive(Debug)]
pub struct PipelineCoordinator {
    config: ExecutorConfig,
    stages: Vec<StageExecutor>,
    phase: Mutex<PipelinePhase>,
    run_lock: Mutex<()>,
    reports_tx: mpsc::Sender<StageReport>,
    reports_rx: Mutex<Receiver<StageReport>>,
    cutoff: Arc<AtomicU64>,
    in_flight: Arc<InFlight>,
}

impl PipelineCoordinator {
    /// Load one graph per stage. The outputs of stage `k` become the graph
    /// inputs of stage `k + 1`.
    pub fn new(
        config: ExecutorConfig,
        graphs: Vec<Arc<Graph>>,
        registry: Arc<NodeExecutorRegistry>,
        runtime: &dyn DeviceRuntime,
        metrics: Option<ExecutorMetrics>,
    ) -> Result<Self> {
        config.validate()?;
        if graphs.is_empty() {
            return Err(HyflowError::InvalidGraph {
                cause: "a pipeline needs at least one stage".to_string(),
            });
        }
        for pair in graphs.windows(2) {
            let produced = output_count(&pair[0])?;
            let expected = pair[1].data_nodes().len();
            if produced != expected {
                return Err(HyflowError::InputCount {
                    expected,
                    actual: produced,
                });
            }
        }

        let stages = graphs
            .into_iter()
            .enumerate()
            .map(|(k, graph)| {
                StageExecutor::new(
                    StageId::new(k as u32),
                    graph,
                    Arc::clone(&registry),
                    runtime,
                    &config,
                    metrics.clone(),
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let (reports_tx, reports_rx) = mpsc::channel();
        tracing::info!(stages = stages.len(), "Pipeline created");

        Ok(Self {
            config,
            stages,
            phase: Mutex::new(PipelinePhase::Created),
            run_lock: Mutex::new(()),
            reports_tx,
            reports_rx: Mutex::new(reports_rx),
            cutoff: Arc::new(AtomicU64::new(u64::MAX)),
            in_flight: Arc::new(InFlight::default()),
        })
    }

    /// Initialize every stage's state and start the stage workers.
    pub fn init(&self) -> Result<()> {
        let mut phase = self.phase.lock();
        if *phase != PipelinePhase::Created {
            return Err(self.wrong_phase(*phase, "init"));
        }
        for (k, stage) in self.stages.iter().enumerate() {
            stage.state().init();
            let links = StageLinks {
                upstream: k
                    .checked_sub(1)
                    .map(|prev| Arc::clone(self.stages[prev].subject())),
                downstream: match self.stages.get(k + 1) {
                    Some(next) => Some(next.sender()?),
                    None => None,
                },
                reports: self.reports_tx.clone(),
                cutoff: Arc::clone(&self.cutoff),
                in_flight: Arc::clone(&self.in_flight),
            };
            stage.start(links)?;
        }
        *phase = PipelinePhase::Ready;
        tracing::info!(stages = self.stages.len(), "Pipeline initialized");
        Ok(())
    }

    /// Run `iteration_end` iterations.
    ///
    /// `inputs` holds either one input set per iteration or a single set
    /// reused by every iteration. End of sequence stops further iterations
    /// and is reported in the outcome, not as an error.
    pub fn execute(&self, inputs: Vec<Vec<TensorValue>>) -> Result<PipelineOutcome> {
        let _run = self.run_lock.lock();
        let phase = *self.phase.lock();
        if phase != PipelinePhase::Ready {
            return Err(self.wrong_phase(phase, "execute"));
        }

        let iterations = self.config.iteration_end;
        if inputs.len() != 1 && inputs.len() as u64 != iterations {
            return Err(HyflowError::InputCount {
                expected: usize::try_from(iterations).unwrap_or(usize::MAX),
                actual: inputs.len(),
            });
        }

        let run_id = RunId::new();
        let span = instrument_pipeline!(run_id, "execute");
        let _enter = span.enter();

        for stage in &self.stages {
            stage.context().begin_run_with(run_id);
            stage.state().init();
            stage.subject().reset();
        }
        self.cutoff.store(u64::MAX, Ordering::Release);
        let reports = self.reports_rx.lock();
        let stale = reports.try_iter().count();
        if stale > 0 {
            tracing::warn!(stale, "Discarded reports from a previous run");
        }

        let first = &self.stages[0];
        let mut submit_error = None;
        for iteration in 0..iterations {
            if iteration >= self.cutoff.load(Ordering::Acquire) {
                break;
            }
            let index = usize::try_from(iteration).unwrap_or(usize::MAX);
            let stage_inputs = inputs
                .get(index)
                .or_else(|| inputs.first())
                .cloned()
                .unwrap_or_default();
            self.in_flight.enter();
            if let Err(e) = first.submit(StageTask {
                iteration,
                inputs: stage_inputs,
            }) {
                self.in_flight.leave();
                submit_error = Some(e);
                break;
            }
        }
        self.in_flight.wait_idle();

        if *self.phase.lock() == PipelinePhase::Stopped {
            return Err(HyflowError::Aborted {
                reason: "pipeline stopped during execute".to_string(),
            });
        }

        let mut outputs: BTreeMap<u64, Vec<TensorValue>> = BTreeMap::new();
        let mut failure: Option<(u64, HyflowError)> = None;
        let mut end_of_sequence: Option<u64> = None;
        for report in reports.try_iter() {
            match report {
                StageReport::Outputs { iteration, outputs: values } => {
                    outputs.insert(iteration, values);
                }
                StageReport::EndOfSequence { stage, iteration } => {
                    tracing::debug!(stage = %stage, iteration, "Pipeline reached end of sequence");
                    end_of_sequence = Some(end_of_sequence.map_or(iteration, |e| e.min(iteration)));
                }
                StageReport::Failed { iteration, error } => {
                    if failure.as_ref().map_or(true, |(at, _)| iteration < *at) {
                        failure = Some((iteration, error));
                    }
                }
            }
        }

        if let Some((_, error)) = failure {
            return Err(error);
        }
        if let Some(error) = submit_error {
            return Err(error);
        }

        let limit = end_of_sequence.unwrap_or(u64::MAX);
        let outputs: Vec<Vec<TensorValue>> = outputs
            .into_iter()
            .filter(|(iteration, _)| *iteration < limit)
            .map(|(_, values)| values)
            .collect();
        tracing::info!(
            iterations = outputs.len(),
            end_of_sequence = end_of_sequence.is_some(),
            "Pipeline execute finished"
        );
        Ok(PipelineOutcome {
            outputs,
            end_of_sequence: end_of_sequence.is_some(),
        })
    }

    /// Stop every stage in stage order and release their resources.
    /// Idempotent.
    pub fn stop(&self) {
        {
            let mut phase = self.phase.lock();
            if *phase == PipelinePhase::Stopped {
                return;
            }
            *phase = PipelinePhase::Stopped;
        }
        for stage in &self.stages {
            stage.subject().abort();
        }
        for stage in &self.stages {
            stage.close();
        }
        for stage in &self.stages {
            stage.shutdown();
        }
        tracing::info!(stages = self.stages.len(), "Pipeline stopped");
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> PipelinePhase {
        *self.phase.lock()
    }

    /// The stages, in order.
    pub fn stages(&self) -> &[StageExecutor] {
        &self.stages
    }

    fn wrong_phase(&self, phase: PipelinePhase, operation: &str) -> HyflowError {
        HyflowError::InvalidState {
            component: "pipeline".to_string(),
            cause: format!("{operation} called while {phase:?}"),
        }
    }
}

impl Drop for PipelineCoordinator {
    fn drop(&mut self) {
        self.stop();
    }
}

fn output_count(graph: &Graph) -> Result<usize> {
    match graph.output_collector() {
        Some(collector) if graph.is_dynamic() => Ok(graph.node(collector)?.num_inputs),
        _ => Ok(graph.graph_outputs().len()),
    }
}
