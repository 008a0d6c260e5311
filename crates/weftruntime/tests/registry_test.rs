// crates/weftruntime/tests/registry_test.rs

mod common;

use common::ScriptedRunner;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use weftcore::{
    ComponentSpec, NodeSpec, PortSpec, RegionMode, Workflow, WorkflowError,
};
use weftruntime::{
    validate_batch, validate_workflow, ComponentLoader, ComponentRegistry, RunnerRegistry,
    RuntimeConfig,
};

fn write_manifest(dir: &Path, file: &str, id: &str, source: &str) {
    let manifest = serde_json::json!({
        "id": id,
        "name": id,
        "runtime": "test",
        "source_path": source,
        "inputs": [{ "name": "input" }],
        "outputs": [{ "name": "output" }],
        "requirements": ["numpy"],
    });
    std::fs::write(dir.join(file), manifest.to_string()).unwrap();
}

fn registry_with(specs: Vec<ComponentSpec>) -> ComponentRegistry {
    let mut registry = ComponentRegistry::new();
    for spec in specs {
        registry.register(spec);
    }
    registry
}

fn test_runners() -> RunnerRegistry {
    let mut runners = RunnerRegistry::new();
    runners.register(Arc::new(ScriptedRunner::new()));
    runners
}

// ============================================================================
// Loader
// ============================================================================

#[test]
fn test_loader_walks_subdirectories() {
    let root = TempDir::new().unwrap();
    let nested = root.path().join("math");
    std::fs::create_dir(&nested).unwrap();
    write_manifest(root.path(), "a.component.json", "alpha", "alpha.py");
    write_manifest(&nested, "b.component.json", "beta", "beta.py");
    std::fs::write(root.path().join("notes.json"), "{}").unwrap();

    let mut registry = ComponentRegistry::new();
    let loaded = ComponentLoader::new(root.path()).load_into(&mut registry).unwrap();

    assert_eq!(loaded, 2);
    let ids: Vec<_> = registry.list().iter().map(|c| c.id.clone()).collect();
    assert_eq!(ids, vec!["alpha", "beta"]);
}

#[test]
fn test_loader_resolves_relative_source() {
    let root = TempDir::new().unwrap();
    write_manifest(root.path(), "a.component.json", "alpha", "src/alpha.py");

    let spec =
        ComponentLoader::load_manifest(&root.path().join("a.component.json")).unwrap();

    assert_eq!(spec.source_path, root.path().join("src/alpha.py"));
    assert_eq!(spec.requirement_list(), vec!["numpy".to_string()]);
}

#[test]
fn test_loader_keeps_absolute_source() {
    let root = TempDir::new().unwrap();
    write_manifest(root.path(), "a.component.json", "alpha", "/opt/alpha.py");

    let spec =
        ComponentLoader::load_manifest(&root.path().join("a.component.json")).unwrap();

    assert_eq!(spec.source_path, Path::new("/opt/alpha.py"));
}

#[test]
fn test_loader_rejects_malformed_manifest() {
    let root = TempDir::new().unwrap();
    std::fs::write(root.path().join("bad.component.json"), "{ not json").unwrap();

    let mut registry = ComponentRegistry::new();
    let result = ComponentLoader::new(root.path()).load_into(&mut registry);

    assert!(result.is_err());
}

// ============================================================================
// Registries
// ============================================================================

#[test]
fn test_later_registration_replaces_earlier() {
    let registry = registry_with(vec![
        ComponentSpec::new("alpha", "test", "one.py"),
        ComponentSpec::new("alpha", "test", "two.py"),
    ]);

    assert_eq!(registry.len(), 1);
    assert_eq!(
        registry.lookup("alpha").unwrap().source_path,
        Path::new("two.py")
    );
}

#[test]
fn test_unknown_component_and_runtime() {
    let registry = ComponentRegistry::new();
    let runners = RunnerRegistry::new();

    assert!(matches!(
        registry.lookup("ghost"),
        Err(WorkflowError::UnknownComponent(id)) if id == "ghost"
    ));
    assert!(matches!(
        runners.get("cobol"),
        Err(WorkflowError::UnknownRuntime(kind)) if kind == "cobol"
    ));
}

// ============================================================================
// Validation
// ============================================================================

#[test]
fn test_single_input_rejects_two_connections() {
    let registry = registry_with(vec![
        ComponentSpec::new("source", "test", "s.test"),
        ComponentSpec::new("sink", "test", "k.test").with_input(PortSpec::new("input")),
    ]);
    let mut workflow = Workflow::new("fan-in");
    let a = workflow.add_node(NodeSpec::component("source"));
    let b = workflow.add_node(NodeSpec::component("source"));
    let sink = workflow.add_node(NodeSpec::component("sink"));
    workflow.connect(a, "output", sink, "input");
    workflow.connect(b, "output", sink, "input");

    let result = validate_workflow(&workflow, &registry);

    assert!(matches!(result, Err(WorkflowError::InvalidConnection(_))));
}

#[test]
fn test_multi_input_accepts_many_connections() {
    let registry = registry_with(vec![
        ComponentSpec::new("source", "test", "s.test"),
        ComponentSpec::new("sink", "test", "k.test").with_input(PortSpec::new("input").multi()),
    ]);
    let mut workflow = Workflow::new("fan-in");
    let a = workflow.add_node(NodeSpec::component("source"));
    let b = workflow.add_node(NodeSpec::component("source"));
    let sink = workflow.add_node(NodeSpec::component("sink"));
    workflow.connect(a, "output", sink, "input");
    workflow.connect(b, "output", sink, "input");

    assert!(validate_workflow(&workflow, &registry).is_ok());
}

#[test]
fn test_dangling_connection_rejected() {
    let mut workflow = Workflow::new("dangling");
    let a = workflow.add_node(NodeSpec::component("source"));
    workflow.connect(a, "output", uuid::Uuid::new_v4(), "input");

    let result = validate_workflow(&workflow, &ComponentRegistry::new());

    assert!(matches!(result, Err(WorkflowError::InvalidConnection(_))));
}

#[test]
fn test_node_in_two_regions_rejected() {
    let mut workflow = Workflow::new("shared member");
    let member = workflow.add_node(NodeSpec::component("source"));
    workflow.add_node(NodeSpec::region(
        RegionMode::IterateNTimes { max_iterations: 2 },
        vec![member],
    ));
    workflow.add_node(NodeSpec::region(
        RegionMode::IterateNTimes { max_iterations: 2 },
        vec![member],
    ));

    let result = validate_workflow(&workflow, &ComponentRegistry::new());

    assert!(matches!(result, Err(WorkflowError::Configuration(_))));
}

#[test]
fn test_region_member_must_exist() {
    let mut workflow = Workflow::new("ghost member");
    workflow.add_node(NodeSpec::region(
        RegionMode::IterateNTimes { max_iterations: 2 },
        vec![uuid::Uuid::new_v4()],
    ));

    let result = validate_workflow(&workflow, &ComponentRegistry::new());

    assert!(matches!(result, Err(WorkflowError::NodeNotFound(_))));
}

#[test]
fn test_batch_needs_a_runner_for_every_component() {
    let registry = registry_with(vec![ComponentSpec::new("script", "python", "s.py")]);
    let mut workflow = Workflow::new("no runner");
    let node = workflow.add_node(NodeSpec::component("script"));

    let result = validate_batch(&workflow, &[node], &registry, &test_runners());

    assert!(matches!(result, Err(WorkflowError::UnknownRuntime(kind)) if kind == "python"));
}

#[test]
fn test_batch_rejects_stray_proxy() {
    let mut workflow = Workflow::new("stray proxy");
    let proxy = workflow.add_node(NodeSpec::input_proxy());

    let result = validate_batch(&workflow, &[proxy], &ComponentRegistry::new(), &test_runners());

    assert!(matches!(result, Err(WorkflowError::Configuration(_))));
}

#[test]
fn test_batch_rejects_empty_fold_condition() {
    let mut workflow = Workflow::new("empty condition");
    let region = workflow.add_node(NodeSpec::region(
        RegionMode::FoldWhile {
            condition: "  ".to_string(),
            max_iterations: 3,
        },
        vec![],
    ));

    let result = validate_batch(&workflow, &[region], &ComponentRegistry::new(), &test_runners());

    assert!(matches!(result, Err(WorkflowError::Configuration(_))));
}

// ============================================================================
// Config
// ============================================================================

#[test]
fn test_config_file_keeps_defaults_for_missing_fields() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("weft.json");
    std::fs::write(&path, r#"{ "node_timeout_ms": 1500, "retain_run_files": false }"#).unwrap();

    let config = RuntimeConfig::load(&path).unwrap();

    assert_eq!(config.node_timeout().as_millis(), 1500);
    assert!(!config.retain_run_files);
    assert_eq!(config.event_buffer_size, RuntimeConfig::default().event_buffer_size);
}
