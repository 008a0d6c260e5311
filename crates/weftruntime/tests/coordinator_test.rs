// crates/weftruntime/tests/coordinator_test.rs

mod common;

use common::standard_runner;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::Receiver;
use weftcore::{
    BranchCondition, ComponentSpec, ExecutionEvent, FlowError, NodeSpec, NodeStatus, PortSpec,
    Value, Workflow, WorkflowError,
};
use weftruntime::{BatchOutcome, RunTarget, RunnerRegistry, RuntimeConfig, WeftRuntime};

fn drain(rx: &mut Receiver<ExecutionEvent>) -> Vec<ExecutionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn terminal_count(events: &[ExecutionEvent]) -> usize {
    events.iter().filter(|e| e.is_terminal()).count()
}

// ============================================================================
// Sequencing
// ============================================================================

#[tokio::test]
async fn test_chain_runs_in_order_and_passes_values() {
    let runner = standard_runner();
    let runtime = runner.clone().into_runtime();
    let mut rx = runtime.subscribe_events();

    let mut workflow = Workflow::new("chain");
    let source = workflow.add_node(
        NodeSpec::component("constant")
            .with_name("source")
            .with_param("value", 3),
    );
    let first = workflow.add_node(NodeSpec::component("double").with_name("first"));
    let second = workflow.add_node(NodeSpec::component("double").with_name("second"));
    workflow.connect(first, "output", second, "input");
    workflow.connect(source, "output", first, "input");

    let report = runtime
        .run(&mut workflow, RunTarget::Full, "python3")
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(report.completed, vec![source, first, second]);
    assert_eq!(runner.calls(), vec!["source", "first", "second"]);
    assert_eq!(report.outputs_of(second).unwrap()["output"], Value::from(12));

    // written back into the graph
    let node = workflow.find_node(second).unwrap();
    assert_eq!(node.status, NodeStatus::Success);
    assert_eq!(node.outputs["output"], Value::from(12));

    let events = drain(&mut rx);
    assert!(matches!(events.first(), Some(ExecutionEvent::BatchStarted { .. })));
    assert!(matches!(events.last(), Some(ExecutionEvent::BatchCompleted { .. })));
    assert_eq!(terminal_count(&events), 1);
}

#[tokio::test]
async fn test_failure_halts_batch() {
    let runner = standard_runner();
    let runtime = runner.clone().into_runtime();
    let mut rx = runtime.subscribe_events();

    let mut workflow = Workflow::new("failing");
    let source = workflow.add_node(NodeSpec::component("constant").with_name("source"));
    let broken = workflow.add_node(NodeSpec::component("fail").with_name("broken"));
    let after = workflow.add_node(NodeSpec::component("double").with_name("after"));
    workflow.connect(source, "output", broken, "input");
    workflow.connect(broken, "output", after, "input");

    let report = runtime
        .run(&mut workflow, RunTarget::Full, "python3")
        .await
        .unwrap();

    assert_eq!(
        report.outcome,
        BatchOutcome::Failed {
            node_id: broken,
            error: format!("Node {} failed: execution_error: boom", broken),
        }
    );
    assert_eq!(runner.calls(), vec!["source", "broken"]);
    assert_eq!(report.status_of(broken), NodeStatus::Failed);
    assert_eq!(report.status_of(after), NodeStatus::Unrun);

    let events = drain(&mut rx);
    assert_eq!(terminal_count(&events), 1);
    assert!(matches!(
        events.last(),
        Some(ExecutionEvent::BatchFailed {
            cancelled: false,
            ..
        })
    ));
}

#[tokio::test]
async fn test_missing_required_input_fails_node() {
    let runtime = standard_runner().into_runtime();

    let mut workflow = Workflow::new("unwired");
    let lonely = workflow.add_node(NodeSpec::component("double").with_name("lonely"));

    let report = runtime
        .run(&mut workflow, RunTarget::Full, "python3")
        .await
        .unwrap();

    assert!(matches!(
        report.outcome,
        BatchOutcome::Failed { node_id, .. } if node_id == lonely
    ));
}

// ============================================================================
// Targets
// ============================================================================

#[tokio::test]
async fn test_run_up_to_node() {
    let runner = standard_runner();
    let runtime = runner.clone().into_runtime();

    let mut workflow = Workflow::new("targets");
    let a = workflow.add_node(
        NodeSpec::component("constant")
            .with_name("a")
            .with_param("value", 1),
    );
    let b = workflow.add_node(NodeSpec::component("double").with_name("b"));
    let c = workflow.add_node(NodeSpec::component("double").with_name("c"));
    workflow.connect(a, "output", b, "input");
    workflow.connect(b, "output", c, "input");

    let report = runtime
        .run(&mut workflow, RunTarget::UpTo(b), "python3")
        .await
        .unwrap();

    assert_eq!(report.completed, vec![a, b]);
    assert_eq!(report.status_of(c), NodeStatus::Unrun);

    // a later single-node run reads b's stored output
    let report = runtime
        .run(&mut workflow, RunTarget::Only(c), "python3")
        .await
        .unwrap();
    assert_eq!(report.outputs_of(c).unwrap()["output"], Value::from(4));
    assert_eq!(runner.calls(), vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_unknown_component_fails_before_running() {
    let runner = standard_runner();
    let runtime = runner.clone().into_runtime();
    let mut rx = runtime.subscribe_events();

    let mut workflow = Workflow::new("unknown");
    workflow.add_node(NodeSpec::component("constant").with_name("ok"));
    workflow.add_node(NodeSpec::component("does/not/exist"));

    let result = runtime.run(&mut workflow, RunTarget::Full, "python3").await;

    assert!(matches!(
        result,
        Err(FlowError::Workflow(WorkflowError::UnknownComponent(_)))
    ));
    assert!(runner.calls().is_empty());
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn test_fan_in_on_single_input_fails_before_running() {
    let runner = standard_runner().on("sink", common::double);
    let mut components = runner.components();
    components.register(
        ComponentSpec::new("sink", common::TEST_RUNTIME, "sink.test")
            .with_input(PortSpec::new("input")),
    );
    let mut runners = RunnerRegistry::new();
    runners.register(Arc::new(runner.clone()));
    let runtime = WeftRuntime::new(components, runners, RuntimeConfig::default());
    let mut rx = runtime.subscribe_events();

    let mut workflow = Workflow::new("fan-in");
    let a = workflow.add_node(NodeSpec::component("constant").with_name("a"));
    let b = workflow.add_node(NodeSpec::component("constant").with_name("b"));
    let sink = workflow.add_node(NodeSpec::component("sink").with_name("sink"));
    workflow.connect(a, "output", sink, "input");
    workflow.connect(b, "output", sink, "input");

    let result = runtime.run(&mut workflow, RunTarget::Only(sink), "python3").await;

    assert!(matches!(
        result,
        Err(FlowError::Workflow(WorkflowError::InvalidConnection(_)))
    ));
    assert!(runner.calls().is_empty());
    assert!(drain(&mut rx).is_empty());
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn test_cancel_stops_running_batch() {
    let runner = standard_runner()
        .on("sleepy", common::constant)
        .slow("sleepy", Duration::from_secs(30));
    let runtime = runner.clone().into_runtime();
    let mut rx = runtime.subscribe_events();

    let mut workflow = Workflow::new("slow");
    let sleepy = workflow.add_node(NodeSpec::component("sleepy").with_name("sleepy"));
    let after = workflow.add_node(NodeSpec::component("constant").with_name("after"));
    workflow.connect(sleepy, "output", after, "input");

    let started = Instant::now();
    let handle = runtime
        .start(&workflow, RunTarget::Full, "python3")
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.cancel();
    let report = handle.wait().await.unwrap();

    assert_eq!(report.outcome, BatchOutcome::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(runner.calls(), vec!["sleepy"]);
    assert_eq!(report.status_of(after), NodeStatus::Unrun);

    let events = drain(&mut rx);
    assert_eq!(terminal_count(&events), 1);
    assert!(matches!(
        events.last(),
        Some(ExecutionEvent::BatchFailed {
            cancelled: true,
            ..
        })
    ));
}

// ============================================================================
// Branches and variables
// ============================================================================

#[tokio::test]
async fn test_branch_skips_inactive_path() {
    let runner = standard_runner();
    let runtime = runner.clone().into_runtime();

    let mut workflow = Workflow::new("branching");
    let source = workflow.add_node(
        NodeSpec::component("constant")
            .with_name("source")
            .with_param("value", 5),
    );
    let branch = workflow.add_node(
        NodeSpec::branch(vec![BranchCondition::new("big", "input_input > 3")], true)
            .with_name("check"),
    );
    let big = workflow.add_node(NodeSpec::component("double").with_name("big path"));
    let small = workflow.add_node(NodeSpec::component("double").with_name("small path"));
    let after_small = workflow.add_node(NodeSpec::component("double").with_name("after small"));
    workflow.connect(source, "output", branch, "input");
    workflow.connect(branch, "big", big, "input");
    workflow.connect(branch, "else", small, "input");
    workflow.connect(small, "output", after_small, "input");

    let report = runtime
        .run(&mut workflow, RunTarget::Full, "python3")
        .await
        .unwrap();

    assert!(report.is_success(), "outcome: {:?}", report.outcome);
    assert_eq!(report.outputs_of(big).unwrap()["output"], Value::from(10));
    assert_eq!(report.status_of(small), NodeStatus::Unrun);
    assert_eq!(report.status_of(after_small), NodeStatus::Unrun);
    assert_eq!(runner.calls(), vec!["source", "big path"]);
}

#[tokio::test]
async fn test_outputs_become_node_variables() {
    let runtime = standard_runner().into_runtime();

    let mut workflow = Workflow::new("variables");
    workflow.variables.set_custom("base", 20);
    let source = workflow.add_node(
        NodeSpec::component("constant")
            .with_name("source")
            .with_param("value", "{{ custom_base + 1 }}"),
    );
    let reader = workflow.add_node(
        NodeSpec::component("constant")
            .with_name("reader")
            .with_param("value", "got {{ node_source_output }}"),
    );
    workflow.connect(source, "output", reader, "input");

    let report = runtime
        .run(&mut workflow, RunTarget::Full, "python3")
        .await
        .unwrap();

    assert_eq!(report.outputs_of(source).unwrap()["output"], Value::from(21));
    assert_eq!(
        report.outputs_of(reader).unwrap()["output"],
        Value::from("got 21")
    );
    assert_eq!(
        workflow.variables.node["source_output"].value,
        Value::from(21)
    );
    assert!(!workflow.variables.env.run_id.is_empty());
}

// ============================================================================
// Workflow store
// ============================================================================

#[tokio::test]
async fn test_registered_workflow_runs_by_id() {
    let runtime = standard_runner().into_runtime();

    let mut workflow = Workflow::new("stored");
    let node = workflow.add_node(
        NodeSpec::component("constant")
            .with_name("only")
            .with_param("value", "x"),
    );
    let id = runtime.register_workflow(workflow).await;

    let report = runtime
        .execute_workflow(id, RunTarget::Full, "python3")
        .await
        .unwrap();
    assert!(report.is_success());

    let stored = runtime.get_workflow(id).await.unwrap();
    assert_eq!(stored.find_node(node).unwrap().status, NodeStatus::Success);
    assert_eq!(runtime.list_workflows().await.len(), 1);
    assert!(runtime.remove_workflow(id).await.is_some());
    assert!(matches!(
        runtime.execute_workflow(id, RunTarget::Full, "python3").await,
        Err(FlowError::Workflow(WorkflowError::NotFound(_)))
    ));
}
