mod common;

use common::*;
use hyflow_core::prelude::*;
use hyflow_executor::prelude::*;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

fn collecting_listener() -> (Listener, mpsc::Receiver<RunResult>) {
    let (tx, rx) = mpsc::channel();
    let tx = parking_lot::Mutex::new(tx);
    let listener = Listener::new(move |result| {
        let _ = tx.lock().send(result);
    });
    (listener, rx)
}

fn one_node(op: &str, delay_ms: i64) -> Arc<Graph> {
    let mut b = builder(op);
    let x = b.add_data("x", desc(2));
    let n = b.add_node(delayed(node("N", op, 1, 2), delay_ms).attr("code", AttrValue::Int(5)));
    b.connect(x, 0, n, 0).mark_output(n, 0);
    Arc::new(b.build().unwrap())
}

#[test]
fn execute_returns_outputs() {
    let harness = Harness::new();
    let model = harness.model(&chain(2), ExecutorConfig::default());
    let outputs = model.execute(vec![tensor(&[0.5, 1.5])]).unwrap();
    assert_eq!(outputs[0].to_f32_vec().unwrap(), vec![3.5, 4.5]);
    assert_eq!(model.schedule_state(), ScheduleState::Completed);

    let err = model.execute(vec![]).unwrap_err();
    assert_eq!(err.code(), "E006");
}

#[test]
fn listener_receives_results_in_order() {
    let harness = Harness::new();
    let model = harness.model(&chain(1), ExecutorConfig::default());
    let (listener, rx) = collecting_listener();
    model.start(listener).unwrap();
    assert!(model.start(Listener::new(|_| {})).is_err());

    for id in 0..3u64 {
        model.enqueue_data(RunRequest::new(id, vec![tensor(&[id as f32])])).unwrap();
    }
    for id in 0..3u64 {
        let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(result.request_id, id);
        assert_eq!(result.code, ResultCode::Success);
        assert_eq!(result.outputs[0].to_f32_vec().unwrap(), vec![id as f32 + 3.0]);
    }
}

#[test]
fn result_codes_follow_the_failure() {
    let harness = Harness::new();
    let cases = [
        ("Fail", ExecutorConfig::default(), ResultCode::InternalError),
        ("Eos", ExecutorConfig::default(), ResultCode::EndOfSequence),
        (
            "Pass",
            ExecutorConfig::default()
                .with_event_wait_timeout_ms(20)
                .with_stream_sync_timeout_ms(20),
            ResultCode::Timeout,
        ),
    ];
    for (op, config, expected) in cases {
        let delay = if expected == ResultCode::Timeout { 300 } else { 0 };
        let model = harness.model(&one_node(op, delay), config);
        let (listener, rx) = collecting_listener();
        model.start(listener).unwrap();
        model.enqueue_data(RunRequest::new(7, vec![tensor(&[1.0, 2.0])])).unwrap();

        let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(result.code, expected, "op {op}");
        assert!(result.outputs.is_empty());
        assert!(result.error.is_some());
    }
}

#[test]
fn stop_answers_queued_requests_aborted() {
    let harness = Harness::new();
    let model = harness.model(&one_node("Pass", 100), ExecutorConfig::default());
    let (listener, rx) = collecting_listener();
    model.start(listener).unwrap();
    for id in 0..3u64 {
        model.enqueue_data(RunRequest::new(id, vec![tensor(&[1.0, 1.0])])).unwrap();
    }
    model.stop();

    let results: Vec<RunResult> = rx.try_iter().collect();
    assert_eq!(results.len(), 3);
    let aborted = results
        .iter()
        .filter(|r| r.code == ResultCode::Aborted)
        .count();
    assert!(aborted >= 2, "{results:?}");

    assert!(model.execute(vec![tensor(&[1.0, 1.0])]).unwrap_err().is_aborted());
    assert_eq!(harness.registry.ref_count(ENGINE), 0);
    assert!(!harness.registry.is_live(ENGINE));
}

#[test]
fn full_queue_rejects_without_blocking() {
    let harness = Harness::new();
    let config = ExecutorConfig::default().with_request_queue_capacity(1);
    let model = harness.model(&one_node("Pass", 200), config);
    let (listener, _rx) = collecting_listener();
    model.start(listener).unwrap();

    let rejected: Vec<HyflowError> = (0..3u64)
        .filter_map(|id| {
            model
                .enqueue_data(RunRequest::new(id, vec![tensor(&[0.0, 0.0])]))
                .err()
        })
        .collect();
    assert!(!rejected.is_empty());
    assert!(rejected.iter().all(|e| e.code() == "E402" && e.is_retriable()));
}

#[test]
fn enqueue_requires_start() {
    let harness = Harness::new();
    let model = harness.model(&chain(1), ExecutorConfig::default());
    let err = model
        .enqueue_data(RunRequest::new(0, vec![tensor(&[1.0])]))
        .unwrap_err();
    assert_eq!(err.code(), "E403");
    assert_eq!(model.queued(), 0);
}

#[test]
fn engines_are_shared_and_released() {
    let harness = Harness::new();
    let graph = chain(1);
    let first = harness.model(&graph, ExecutorConfig::default());
    let second = harness.model(&graph, ExecutorConfig::default());
    assert_eq!(harness.registry.ref_count(ENGINE), 2 * graph.node_count());

    drop(first);
    assert_eq!(harness.registry.ref_count(ENGINE), graph.node_count());
    assert!(harness.registry.is_live(ENGINE));
    drop(second);
    assert!(!harness.registry.is_live(ENGINE));
}

#[test]
fn unknown_engine_fails_load() {
    let harness = Harness::new();
    let mut b = GraphBuilder::new("elsewhere").default_engine("cuda");
    let x = b.add_data("x", desc(1));
    b.mark_output(x, 0);
    let graph = Arc::new(b.build().unwrap());
    let err = ModelExecutor::load(
        ExecutorConfig::default(),
        graph,
        Arc::clone(&harness.registry),
        &harness.runtime,
    )
    .unwrap_err();
    assert_eq!(err.code(), "E101");
}

#[test]
fn metrics_count_runs() {
    let harness = Harness::new();
    let model = harness.model(&chain(1), ExecutorConfig::default().with_metrics(true));
    model.execute(vec![tensor(&[1.0])]).unwrap();
    let text = model.metrics().unwrap().encode().unwrap();
    assert!(text.contains("hyflow_runs_total"));
    assert!(text.contains("outcome=\"completed\""));
}
