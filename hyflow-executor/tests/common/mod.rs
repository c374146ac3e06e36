//! Shared fixtures: a scriptable "test" engine and graph helpers.

#![allow(dead_code)]

use hyflow_core::prelude::*;
use hyflow_executor::prelude::*;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub const ENGINE: &str = "test";

/// Events recorded by test kernels, in stream execution order.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<String>>,
    dispatches: Mutex<HashMap<String, usize>>,
}

impl EventLog {
    pub fn push(&self, event: String) {
        self.events.lock().push(event);
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn position(&self, event: &str) -> Option<usize> {
        self.events.lock().iter().position(|e| e == event)
    }

    pub fn dispatched(&self, node: &str) -> usize {
        self.dispatches.lock().get(node).copied().unwrap_or(0)
    }

    fn count_dispatch(&self, node: &str) {
        *self.dispatches.lock().entry(node.to_string()).or_default() += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Op {
    Data,
    Pass,
    AddOne,
    Sum,
    Fail(u32),
    EndOfSequence,
    /// Pass until `iteration` reaches the bound, then end of sequence.
    EosAfter(u64),
}

#[derive(Debug)]
struct TestTask {
    op: Op,
    name: String,
    delay: Duration,
    log: Arc<EventLog>,
}

impl TestTask {
    fn compute(&self, handle: &mut TaskHandle, iteration: u64) -> Result<()> {
        let values: Vec<f32> = match self.op {
            Op::Data => return Ok(()),
            Op::EosAfter(bound) if iteration >= bound => return Err(HyflowError::EndOfSequence),
            Op::Pass | Op::EosAfter(_) => handle.input(0)?.to_f32_vec()?,
            Op::AddOne => handle
                .input(0)?
                .to_f32_vec()?
                .into_iter()
                .map(|v| v + 1.0)
                .collect(),
            Op::Sum => {
                let a = handle.input(0)?.to_f32_vec()?;
                let b = handle.input(1)?.to_f32_vec()?;
                a.iter().zip(&b).map(|(x, y)| x + y).collect()
            }
            Op::Fail(code) => {
                return Err(HyflowError::KernelExecution {
                    node: handle.node,
                    code,
                    cause: format!("{} failed on purpose", self.name),
                })
            }
            Op::EndOfSequence => return Err(HyflowError::EndOfSequence),
        };
        let out = handle.output_mut(0)?;
        for (chunk, v) in out.chunks_exact_mut(4).zip(values) {
            chunk.copy_from_slice(&v.to_le_bytes());
        }
        Ok(())
    }
}

impl NodeTask for TestTask {
    fn infer_shape(&self, _node: &NodeDescriptor, inputs: &[TensorDesc]) -> Result<Vec<TensorDesc>> {
        Ok(inputs.iter().take(1).cloned().collect())
    }

    fn execute_task(&self, handle: TaskHandle, ctx: &TaskContext, done: DoneCallback) -> Result<()> {
        self.log.count_dispatch(&self.name);
        let task = TestTask {
            op: self.op,
            name: self.name.clone(),
            delay: self.delay,
            log: Arc::clone(&self.log),
        };
        let iteration = ctx.iteration;
        ctx.stream.launch(Box::new(move || {
            let mut handle = handle;
            task.log.push(format!("start:{}:{iteration}", task.name));
            if !task.delay.is_zero() {
                std::thread::sleep(task.delay);
            }
            let result = task.compute(&mut handle, iteration).map(|()| handle);
            task.log.push(format!("end:{}:{iteration}", task.name));
            done(result);
        }))
    }
}

/// Engine whose kernels are chosen by op type and tuned by attributes:
/// `delay_ms` sleeps on the stream, `code` is the failure code of `Fail`
/// and `after` the first exhausted iteration of `EosAfter`.
pub struct TestEngine {
    log: Arc<EventLog>,
}

impl NodeExecutor for TestEngine {
    fn engine(&self) -> &str {
        ENGINE
    }

    fn load_task(&self, node: &NodeDescriptor) -> Result<Arc<dyn NodeTask>> {
        let op = match node.op_type.as_str() {
            "Data" => Op::Data,
            "Pass" => Op::Pass,
            "AddOne" => Op::AddOne,
            "Sum" => Op::Sum,
            "Fail" => Op::Fail(node.attr_i64("code").unwrap_or(1) as u32),
            "Eos" => Op::EndOfSequence,
            "EosAfter" => Op::EosAfter(node.attr_i64("after").unwrap_or(0) as u64),
            other => {
                return Err(HyflowError::KernelLoad {
                    node: node.id,
                    op_type: other.to_string(),
                    cause: "unknown test op".to_string(),
                })
            }
        };
        Ok(Arc::new(TestTask {
            op,
            name: node.name.clone(),
            delay: Duration::from_millis(node.attr_i64("delay_ms").unwrap_or(0) as u64),
            log: Arc::clone(&self.log),
        }))
    }
}

pub fn registry(log: &Arc<EventLog>) -> Arc<NodeExecutorRegistry> {
    let registry = Arc::new(NodeExecutorRegistry::new());
    let log = Arc::clone(log);
    registry.register_fn(ENGINE, move || {
        Ok(Arc::new(TestEngine {
            log: Arc::clone(&log),
        }) as Arc<dyn NodeExecutor>)
    });
    registry
}

pub fn desc(len: i64) -> TensorDesc {
    TensorDesc::new(DataType::F32, vec![len])
}

pub fn tensor(values: &[f32]) -> TensorValue {
    TensorValue::from_f32(vec![values.len() as i64], values).unwrap()
}

pub fn node(name: &str, op: &str, inputs: usize, len: i64) -> NodeSpec {
    NodeSpec::new(name, op).inputs(inputs).output(desc(len))
}

pub fn delayed(spec: NodeSpec, ms: i64) -> NodeSpec {
    spec.attr("delay_ms", AttrValue::Int(ms))
}

pub fn builder(name: &str) -> GraphBuilder {
    GraphBuilder::new(name).default_engine(ENGINE)
}

/// x -> A -> B -> C, every node adding one.
pub fn chain(len: i64) -> Arc<Graph> {
    let mut b = builder("chain");
    let x = b.add_data("x", desc(len));
    let a = b.add_node(node("A", "AddOne", 1, len));
    let bb = b.add_node(node("B", "AddOne", 1, len));
    let c = b.add_node(node("C", "AddOne", 1, len));
    b.connect(x, 0, a, 0)
        .connect(a, 0, bb, 0)
        .connect(bb, 0, c, 0)
        .mark_output(c, 0);
    Arc::new(b.build().unwrap())
}

pub struct Harness {
    pub log: Arc<EventLog>,
    pub registry: Arc<NodeExecutorRegistry>,
    pub runtime: HostRuntime,
}

impl Harness {
    pub fn new() -> Self {
        let log = Arc::new(EventLog::default());
        Self {
            registry: registry(&log),
            log,
            runtime: HostRuntime::new(),
        }
    }

    /// Load `graph` into a fresh context, state and scheduler.
    pub fn scheduler(
        &self,
        graph: &Arc<Graph>,
        config: &ExecutorConfig,
    ) -> (Arc<ExecutionContext>, Arc<SubgraphState>, SubgraphScheduler) {
        let loaded = Arc::new(LoadedGraph::load(Arc::clone(graph), Arc::clone(&self.registry)).unwrap());
        let ctx = Arc::new(
            ExecutionContext::new(
                StageId::new(0),
                &self.runtime,
                Arc::new(ResourceRegistry::new()),
                config,
                None,
            )
            .unwrap(),
        );
        let state = Arc::new(SubgraphState::new(Arc::clone(graph)).unwrap());
        let scheduler = SubgraphScheduler::new(Arc::clone(&ctx), Arc::clone(&state), loaded);
        (ctx, state, scheduler)
    }

    pub fn model(&self, graph: &Arc<Graph>, config: ExecutorConfig) -> ModelExecutor {
        ModelExecutor::load(config, Arc::clone(graph), Arc::clone(&self.registry), &self.runtime)
            .unwrap()
    }
}
