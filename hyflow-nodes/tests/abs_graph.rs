use hyflow_core::prelude::*;
use hyflow_executor::prelude::*;
use hyflow_nodes::prelude::*;
use std::sync::Arc;

fn f32_desc(len: i64) -> TensorDesc {
    TensorDesc::new(DataType::F32, vec![len])
}

fn registry() -> Arc<NodeExecutorRegistry> {
    let registry = Arc::new(NodeExecutorRegistry::new());
    register_host_kernels(&registry);
    registry
}

fn load(graph: Graph, registry: &Arc<NodeExecutorRegistry>, runtime: &HostRuntime) -> ModelExecutor {
    ModelExecutor::load(
        ExecutorConfig::default(),
        Arc::new(graph),
        Arc::clone(registry),
        runtime,
    )
    .unwrap()
}

/// x -> Load -> Abs -> Store -> Output
fn abs_graph() -> Graph {
    let mut b = GraphBuilder::new("abs").default_engine(HOST_ENGINE);
    let device = f32_desc(4).with_storage(StorageType::Device);
    let x = b.add_data("x", f32_desc(4));
    let load = b.add_node(NodeSpec::new("load", "Load").inputs(1).output(device.clone()));
    let abs = b.add_node(NodeSpec::new("abs", "Abs").inputs(1).output(device));
    let store = b.add_node(NodeSpec::new("store", "Store").inputs(1).output(f32_desc(4)));
    let out = b.add_node(NodeSpec::new("out", "Output").inputs(1).alias_output(f32_desc(4), 0));
    b.connect(x, 0, load, 0)
        .connect(load, 0, abs, 0)
        .connect(abs, 0, store, 0)
        .connect(store, 0, out, 0)
        .mark_output(out, 0);
    b.build().unwrap()
}

#[test]
fn abs_graph_computes_absolute_values() {
    let registry = registry();
    let runtime = HostRuntime::new();
    let model = load(abs_graph(), &registry, &runtime);

    let x = TensorValue::from_f32(vec![4], &[-1.5, 2.0, -0.0, -8.25]).unwrap();
    let outputs = model.execute(vec![x]).unwrap();

    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].to_f32_vec().unwrap(), vec![1.5, 2.0, 0.0, 8.25]);
    assert_eq!(outputs[0].desc().storage, StorageType::Host);
    for node in model.graph().execution_order() {
        assert_eq!(model.state().gates().release_count(*node).unwrap(), 1);
    }
}

#[test]
fn engine_lives_as_long_as_a_model_uses_it() {
    let registry = registry();
    let runtime = HostRuntime::new();
    assert!(!registry.is_live(HOST_ENGINE));

    let model = load(abs_graph(), &registry, &runtime);
    assert!(registry.is_live(HOST_ENGINE));
    assert_eq!(registry.ref_count(HOST_ENGINE), model.graph().node_count());

    model.stop();
    assert_eq!(registry.ref_count(HOST_ENGINE), 0);
    assert!(!registry.is_live(HOST_ENGINE));
}

#[test]
fn binary_ops_combine_two_inputs() {
    let registry = registry();
    let runtime = HostRuntime::new();
    let mut b = GraphBuilder::new("fma").default_engine(HOST_ENGINE);
    let x = b.add_data("x", f32_desc(3));
    let y = b.add_data("y", f32_desc(3));
    let mul = b.add_node(NodeSpec::new("mul", "Mul").inputs(2).output(f32_desc(3)));
    let add = b.add_node(NodeSpec::new("add", "Add").inputs(2).output(f32_desc(3)));
    let relu = b.add_node(NodeSpec::new("relu", "Relu").inputs(1).output(f32_desc(3)));
    b.connect(x, 0, mul, 0)
        .connect(y, 0, mul, 1)
        .connect(mul, 0, add, 0)
        .connect(x, 0, add, 1)
        .connect(add, 0, relu, 0)
        .mark_output(relu, 0);
    let model = load(b.build().unwrap(), &registry, &runtime);

    let x = TensorValue::from_f32(vec![3], &[1.0, 2.0, 3.0]).unwrap();
    let y = TensorValue::from_f32(vec![3], &[2.0, -3.0, 0.5]).unwrap();
    let outputs = model.execute(vec![x, y]).unwrap();
    // x * y + x, clamped at zero
    assert_eq!(outputs[0].to_f32_vec().unwrap(), vec![3.0, 0.0, 4.5]);
}

#[test]
fn dequeue_from_empty_resource_ends_the_sequence() {
    let registry = registry();
    let runtime = HostRuntime::new();
    let mut b = GraphBuilder::new("drain").default_engine(HOST_ENGINE);
    let pop = b.add_node(
        NodeSpec::new("pop", "Dequeue")
            .output(f32_desc(2))
            .attr("handle", AttrValue::Int(7)),
    );
    let neg = b.add_node(NodeSpec::new("neg", "Neg").inputs(1).output(f32_desc(2)));
    b.connect(pop, 0, neg, 0).mark_output(neg, 0);
    let model = load(b.build().unwrap(), &registry, &runtime);

    let queue = model.context().resources().get_or_create(7, 4);
    queue.push(TensorValue::from_f32(vec![2], &[1.0, 2.0]).unwrap()).unwrap();
    queue.push(TensorValue::from_f32(vec![2], &[3.0, -4.0]).unwrap()).unwrap();

    let first = model.execute(Vec::new()).unwrap();
    assert_eq!(first[0].to_f32_vec().unwrap(), vec![-1.0, -2.0]);
    let second = model.execute(Vec::new()).unwrap();
    assert_eq!(second[0].to_f32_vec().unwrap(), vec![-3.0, 4.0]);

    let err = model.execute(Vec::new()).unwrap_err();
    assert!(err.is_end_of_sequence());
}

#[test]
fn enqueue_feeds_a_resource_across_runs() {
    let registry = registry();
    let runtime = HostRuntime::new();
    let mut b = GraphBuilder::new("fill").default_engine(HOST_ENGINE);
    let x = b.add_data("x", f32_desc(1));
    let push = b.add_node(
        NodeSpec::new("push", "Enqueue")
            .inputs(1)
            .alias_output(f32_desc(1), 0)
            .attr("handle", AttrValue::Int(3))
            .attr("capacity", AttrValue::Int(2)),
    );
    b.connect(x, 0, push, 0).mark_output(push, 0);
    let model = load(b.build().unwrap(), &registry, &runtime);

    for v in [1.0, 2.0] {
        let out = model
            .execute(vec![TensorValue::from_f32(vec![1], &[v]).unwrap()])
            .unwrap();
        assert_eq!(out[0].to_f32_vec().unwrap(), vec![v]);
    }
    let queue = model.context().resources().get(3).unwrap();
    assert_eq!(queue.len(), 2);

    let err = model
        .execute(vec![TensorValue::from_f32(vec![1], &[3.0]).unwrap()])
        .unwrap_err();
    assert_eq!(err.code(), "E501");
    assert_eq!(queue.pop().unwrap().to_f32_vec().unwrap(), vec![1.0]);
}

#[test]
fn dynamic_shapes_follow_the_bound_input() {
    let registry = registry();
    let runtime = HostRuntime::new();
    let dynamic = f32_desc(-1);
    let mut b = GraphBuilder::new("dynamic").default_engine(HOST_ENGINE);
    let x = b.add_data("x", dynamic.clone());
    let abs = b.add_node(NodeSpec::new("abs", "Abs").inputs(1).output(dynamic.clone()));
    let out = b.add_node(NodeSpec::new("out", "Output").inputs(1).alias_output(dynamic, 0));
    b.connect(x, 0, abs, 0)
        .connect(abs, 0, out, 0)
        .set_output_collector(out)
        .set_dynamic(true);
    let model = load(b.build().unwrap(), &registry, &runtime);

    for values in [vec![-1.0, 2.0], vec![-3.0, -4.0, 5.0]] {
        let x = TensorValue::from_f32(vec![values.len() as i64], &values).unwrap();
        let outputs = model.execute(vec![x]).unwrap();
        let expected: Vec<f32> = values.iter().map(|v: &f32| v.abs()).collect();
        assert_eq!(outputs[0].to_f32_vec().unwrap(), expected);
        assert_eq!(outputs[0].desc().shape, vec![values.len() as i64]);
    }
}

#[test]
fn unsupported_op_fails_at_load() {
    let registry = registry();
    let runtime = HostRuntime::new();
    let mut b = GraphBuilder::new("bad").default_engine(HOST_ENGINE);
    let x = b.add_data("x", f32_desc(1));
    let conv = b.add_node(NodeSpec::new("conv", "Conv2d").inputs(1).output(f32_desc(1)));
    b.connect(x, 0, conv, 0).mark_output(conv, 0);

    let err = ModelExecutor::load(
        ExecutorConfig::default(),
        Arc::new(b.build().unwrap()),
        Arc::clone(&registry),
        &runtime,
    )
    .unwrap_err();
    assert_eq!(err.code(), "E102");
    assert_eq!(registry.ref_count(HOST_ENGINE), 0);
}
