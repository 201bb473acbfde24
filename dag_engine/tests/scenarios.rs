use std::sync::Arc;
use std::time::Duration;

use dag_engine::{BoxFuture, Executor, FlagStore, Graph, Kwargs, NodeSpec, Record, WorkError};
use serde_json::{json, Value};

fn delayed_setter(
    key: &'static str,
    value: &'static str,
    delay: Duration,
) -> Arc<dyn Fn(Record, dag_engine::OutputHandle, Kwargs) -> BoxFuture<'static, Result<(), WorkError>> + Send + Sync>
{
    Arc::new(move |_record, output, _kwargs| {
        Box::pin(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            output.insert(key, Value::String(value.to_string()));
            Ok(())
        })
    })
}

fn failing_setter(
) -> Arc<dyn Fn(Record, dag_engine::OutputHandle, Kwargs) -> BoxFuture<'static, Result<(), WorkError>> + Send + Sync>
{
    Arc::new(|_record, _output, _kwargs| Box::pin(async move { Err(WorkError::new("induced failure")) }))
}

// S1: a single node with no parents runs and reports its own metrics.
#[tokio::test]
async fn basic_node() {
    let mut graph = Graph::new();
    graph.add_node(
        NodeSpec::new("solo").with_async_work(delayed_setter("solo", "done", Duration::ZERO)),
        &[],
    );

    let flags = FlagStore::new();
    let executor = Executor::new();
    let (metrics, output) = graph.run(json!({}), &flags, &executor).await;

    assert_eq!(output.snapshot().get("solo"), Some(&Value::String("done".to_string())));
    assert!(metrics.contains_key("solo.execution"));
}

// S2: a node whose work fails reports an exception key and does not affect the rest of the run.
#[tokio::test]
async fn node_failure_is_isolated() {
    let mut graph = Graph::new();
    graph.add_node(NodeSpec::new("breaker").with_async_work(failing_setter()), &[]);

    let flags = FlagStore::new();
    let executor = Executor::new();
    let (metrics, _output) = graph.run(json!({}), &flags, &executor).await;

    assert_eq!(
        metrics.get("breaker.exception").map(String::as_str),
        Some("induced failure")
    );
}

// S3: a linear chain A -> B -> C executes in dependency order, each node observing its parent's
// write before running.
#[tokio::test]
async fn linear_graph_execution() {
    let mut graph = Graph::new();
    let a = graph.add_node(
        NodeSpec::new("node1").with_async_work(delayed_setter("node1", "a", Duration::ZERO)),
        &[],
    );
    let b = graph.add_node(
        NodeSpec::new("node2").with_async_work(delayed_setter("node2", "b", Duration::ZERO)),
        &[a],
    );
    graph.add_node(
        NodeSpec::new("node3").with_async_work(delayed_setter("node3", "c", Duration::ZERO)),
        &[b],
    );

    let flags = FlagStore::new();
    let executor = Executor::new();
    let (metrics, output) = graph.run(json!({}), &flags, &executor).await;

    let snapshot = output.snapshot();
    assert_eq!(snapshot.get("node1"), Some(&Value::String("a".to_string())));
    assert_eq!(snapshot.get("node2"), Some(&Value::String("b".to_string())));
    assert_eq!(snapshot.get("node3"), Some(&Value::String("c".to_string())));
    assert!(metrics.contains_key("node2.awaiting_parents"));
    assert!(metrics.contains_key("node3.awaiting_parents"));
}

// S4: a predicate gates execution on a per-record basis; the same graph skips or runs the node
// depending on what's in the record.
#[tokio::test]
async fn conditional_execution() {
    let mut graph = Graph::new();
    graph.add_node(
        NodeSpec::new("conditional")
            .with_predicate(Arc::new(|record: &Record, _output: &dag_engine::OutputHandle| {
                record.get("trigger_key").is_some()
            }))
            .with_async_work(delayed_setter("conditional", "ran", Duration::ZERO)),
        &[],
    );

    let flags = FlagStore::new();
    let executor = Executor::new();

    let (metrics_skip, output_skip) = graph.run(json!({"other_key": "value"}), &flags, &executor).await;
    assert_eq!(
        metrics_skip.get("conditional.exe_condition").map(String::as_str),
        Some("False")
    );
    assert!(output_skip.snapshot().get("conditional").is_none());

    let (metrics_run, output_run) = graph.run(json!({"trigger_key": "value"}), &flags, &executor).await;
    assert!(!metrics_run.contains_key("conditional.exe_condition"));
    assert_eq!(
        output_run.snapshot().get("conditional"),
        Some(&Value::String("ran".to_string()))
    );
}

// S5: three base nodes with staggered delays feed one middle node, which feeds one top node. The
// top node must only run after every base node has completed, regardless of their relative
// delays.
#[tokio::test]
async fn pyramid_structure() {
    let mut graph = Graph::new();

    let base_ids: Vec<_> = (0..3)
        .map(|i| {
            let key: &'static str = Box::leak(format!("base{i}").into_boxed_str());
            let delay = Duration::from_millis(10 * (3 - i) as u64);
            graph.add_node(
                NodeSpec::new(key).with_async_work(delayed_setter(key, "base", delay)),
                &[],
            )
        })
        .collect();

    let middle = graph.add_node(
        NodeSpec::new("middle").with_async_work(delayed_setter("middle", "mid", Duration::ZERO)),
        &base_ids,
    );
    graph.add_node(
        NodeSpec::new("top").with_async_work(delayed_setter("top", "top", Duration::ZERO)),
        &[middle],
    );

    let flags = FlagStore::new();
    let executor = Executor::new();
    let (metrics, output) = graph.run(json!({}), &flags, &executor).await;

    let snapshot = output.snapshot();
    for i in 0..3 {
        assert_eq!(snapshot.get(&format!("base{i}")), Some(&Value::String("base".to_string())));
    }
    assert_eq!(snapshot.get("middle"), Some(&Value::String("mid".to_string())));
    assert_eq!(snapshot.get("top"), Some(&Value::String("top".to_string())));
    assert!(metrics.contains_key("middle.awaiting_parents"));
    assert!(metrics.contains_key("top.awaiting_parents"));
}

// S6: a node gated on a disabled feature flag never dispatches its work, while a sibling gated
// on an enabled flag does.
#[tokio::test]
async fn feature_flag_gating() {
    std::env::set_var("feature_flag_scenario_on", "true");
    std::env::set_var("feature_flag_scenario_off", "false");

    let mut graph = Graph::new();
    graph.add_node(
        NodeSpec::new("on")
            .with_feature_flag("scenario_on")
            .with_async_work(delayed_setter("on", "ran", Duration::ZERO)),
        &[],
    );
    graph.add_node(
        NodeSpec::new("off")
            .with_feature_flag("scenario_off")
            .with_async_work(delayed_setter("off", "ran", Duration::ZERO)),
        &[],
    );

    let flags = FlagStore::new();
    flags.start(&Executor::new());
    tokio::time::sleep(Duration::from_millis(20)).await;

    let executor = Executor::new();
    let (metrics, output) = graph.run(json!({}), &flags, &executor).await;

    let snapshot = output.snapshot();
    assert_eq!(snapshot.get("on"), Some(&Value::String("ran".to_string())));
    assert_eq!(snapshot.get("off"), None);
    assert_eq!(metrics.get("off.feature_flag").map(String::as_str), Some("False"));

    std::env::remove_var("feature_flag_scenario_on");
    std::env::remove_var("feature_flag_scenario_off");
}
