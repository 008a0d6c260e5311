// crates/weftnodes/tests/isolation_test.rs

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use weftcore::{
    ComponentRunner, ComponentSpec, EventBus, ExecutionEvent, ExecutionId, NodeContext, NodeError,
    NodeEvent, PortSpec, Value,
};
use weftnodes::isolation::{InstallError, RunFiles};
use weftnodes::{
    IsolationConfig, IsolationExecutor, PackageInstaller, PythonTemplate, ScriptTemplate,
    ShellTemplate,
};
use weftruntime::{RunnerRegistry, RuntimeConfig};

// Installer that records requests and can create a marker file to make the
// next attempt succeed
#[derive(Default)]
struct RecordingInstaller {
    installed: Mutex<Vec<String>>,
    marker: Option<PathBuf>,
}

#[async_trait]
impl PackageInstaller for RecordingInstaller {
    async fn install(&self, _interpreter: &Path, package: &str) -> Result<(), InstallError> {
        self.installed.lock().unwrap().push(package.to_string());
        if let Some(marker) = &self.marker {
            std::fs::write(marker, "").unwrap();
        }
        Ok(())
    }
}

fn shell_component(dir: &Path, name: &str, body: &str) -> ComponentSpec {
    let path = dir.join(format!("{}.sh", name));
    std::fs::write(&path, body).unwrap();
    ComponentSpec::new(name, "shell", path)
}

fn executor_with(work_dir: &Path, installer: Arc<RecordingInstaller>) -> IsolationExecutor {
    let config = IsolationConfig {
        work_dir: work_dir.to_path_buf(),
        grace_period: Duration::from_secs(2),
        log_poll_interval: Duration::from_millis(20),
        install_timeout: Duration::from_secs(5),
        retain_run_files: true,
    };
    IsolationExecutor::new(Arc::new(ShellTemplate::default()), installer, config)
}

fn executor(work_dir: &Path) -> IsolationExecutor {
    executor_with(work_dir, Arc::new(RecordingInstaller::default()))
}

// Helper function to create a test context
fn create_test_context(component: ComponentSpec, bus: &EventBus) -> NodeContext {
    let node_id = uuid::Uuid::new_v4();
    let component = Arc::new(component);
    let mut ctx = NodeContext::new(
        node_id,
        component.clone(),
        bus.create_emitter(ExecutionId::new_v4(), node_id),
    );
    ctx.stable_key = format!("{}||instance", component.id);
    ctx.timeout = Duration::from_secs(30);
    ctx
}

const DOUBLE: &str = r#"value=$(sed -n 's/.*"value":\([0-9][0-9]*\).*/\1/p' "$WEFT_TRANSFER_FILE")
printf '{"doubled": %s}' "$((value * 2))" > "$WEFT_RESULT_FILE"
"#;

// ============================================================================
// Successful runs
// ============================================================================

#[tokio::test]
async fn test_result_file_round_trip() {
    let src = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let bus = EventBus::new(100);
    let component = shell_component(
        src.path(),
        "answer",
        r#"printf '{"out": 42}' > "$WEFT_RESULT_FILE""#,
    );

    let output = executor(work.path())
        .run(create_test_context(component, &bus))
        .await
        .unwrap();

    assert_eq!(output.outputs["out"], Value::from(42));
    assert_eq!(output.metadata.attempts, 1);
    let run_dir = output.metadata.run_dir.unwrap();
    assert!(run_dir.join("transfer.json").exists());
    assert!(run_dir
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with("run_answer__instance_"));
}

#[tokio::test]
async fn test_inputs_reach_the_child() {
    let src = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let bus = EventBus::new(100);
    let component = shell_component(src.path(), "double", DOUBLE);

    let mut ctx = create_test_context(component, &bus);
    ctx.inputs.insert("value".to_string(), Value::from(21));

    let output = executor(work.path()).run(ctx).await.unwrap();
    assert_eq!(output.outputs["doubled"], Value::from(42));
}

#[tokio::test]
async fn test_concurrent_runs_do_not_share_files() {
    let src = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let bus = EventBus::new(100);
    let component = shell_component(src.path(), "double", DOUBLE);
    let executor = executor(work.path());

    let mut first = create_test_context(component.clone(), &bus);
    first.inputs.insert("value".to_string(), Value::from(1));
    let mut second = create_test_context(component, &bus);
    second.inputs.insert("value".to_string(), Value::from(2));

    let (a, b) = tokio::join!(executor.run(first), executor.run(second));
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.outputs["doubled"], Value::from(2));
    assert_eq!(b.outputs["doubled"], Value::from(4));
    assert_ne!(a.metadata.run_dir, b.metadata.run_dir);
}

#[tokio::test]
async fn test_declared_outputs_are_selected() {
    let src = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let bus = EventBus::new(100);
    let component = shell_component(
        src.path(),
        "partial",
        r#"printf '{"out": 1, "extra": 2}' > "$WEFT_RESULT_FILE""#,
    )
    .with_output(PortSpec::new("out"))
    .with_output(PortSpec::new("missing"));

    let output = executor(work.path())
        .run(create_test_context(component, &bus))
        .await
        .unwrap();

    assert_eq!(output.outputs.len(), 2);
    assert_eq!(output.outputs["out"], Value::from(1));
    assert_eq!(output.outputs["missing"], Value::Null);
}

#[tokio::test]
async fn test_log_lines_are_streamed() {
    let src = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let bus = EventBus::new(100);
    let mut rx = bus.subscribe();
    let component = shell_component(
        src.path(),
        "chatty",
        "echo hello from component\nprintf '{}' > \"$WEFT_RESULT_FILE\"\n",
    );

    executor(work.path())
        .run(create_test_context(component, &bus))
        .await
        .unwrap();

    let mut lines = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let ExecutionEvent::NodeEvent {
            event: NodeEvent::Log { text },
            ..
        } = event
        {
            lines.push(text);
        }
    }
    assert!(lines.iter().any(|l| l == "hello from component"), "{:?}", lines);
}

#[tokio::test]
async fn test_multibyte_text_split_across_polls() {
    let src = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let bus = EventBus::new(100);
    let mut rx = bus.subscribe();
    // "你好" written as two halves with a pause longer than the poll interval
    let component = shell_component(
        src.path(),
        "greeter",
        "printf '\\344\\275'\nsleep 0.2\nprintf '\\240\\345\\245\\275\\n'\nprintf '{}' > \"$WEFT_RESULT_FILE\"\n",
    );

    executor(work.path())
        .run(create_test_context(component, &bus))
        .await
        .unwrap();

    let mut lines = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let ExecutionEvent::NodeEvent {
            event: NodeEvent::Log { text },
            ..
        } = event
        {
            lines.push(text);
        }
    }
    assert_eq!(lines, vec!["你好".to_string()]);
}

#[tokio::test]
async fn test_run_files_removed_when_not_retained() {
    let src = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let bus = EventBus::new(100);
    let component = shell_component(
        src.path(),
        "answer",
        r#"printf '{"out": 1}' > "$WEFT_RESULT_FILE""#,
    );
    let config = IsolationConfig {
        work_dir: work.path().to_path_buf(),
        retain_run_files: false,
        ..IsolationConfig::default()
    };
    let executor = IsolationExecutor::new(
        Arc::new(ShellTemplate::default()),
        Arc::new(RecordingInstaller::default()),
        config,
    );

    let output = executor
        .run(create_test_context(component, &bus))
        .await
        .unwrap();

    assert!(output.metadata.run_dir.is_none());
    assert_eq!(std::fs::read_dir(work.path()).unwrap().count(), 0);
}

// ============================================================================
// Missing dependencies
// ============================================================================

#[tokio::test]
async fn test_missing_dependency_is_installed_and_retried() {
    let src = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let bus = EventBus::new(100);
    let marker = src.path().join("installed");
    let body = format!(
        "if [ -f '{}' ]; then\n  printf '{{\"out\": 2}}' > \"$WEFT_RESULT_FILE\"\nelse\n  weft_tool_that_does_not_exist\nfi\n",
        marker.display()
    );
    let component =
        shell_component(src.path(), "needs_tool", &body).with_requirement("fake-pkg, other-pkg");
    let installer = Arc::new(RecordingInstaller {
        installed: Mutex::new(Vec::new()),
        marker: Some(marker),
    });

    let output = executor_with(work.path(), installer.clone())
        .run(create_test_context(component, &bus))
        .await
        .unwrap();

    assert_eq!(output.outputs["out"], Value::from(2));
    assert_eq!(output.metadata.attempts, 2);
    assert_eq!(
        *installer.installed.lock().unwrap(),
        vec!["fake-pkg".to_string(), "other-pkg".to_string()]
    );
}

#[tokio::test]
async fn test_second_missing_dependency_failure_is_fatal() {
    let src = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let bus = EventBus::new(100);
    let component = shell_component(src.path(), "broken", "weft_tool_that_does_not_exist\n")
        .with_requirement("fake-pkg");
    let installer = Arc::new(RecordingInstaller::default());

    let result = executor_with(work.path(), installer.clone())
        .run(create_test_context(component, &bus))
        .await;

    match result {
        Err(NodeError::Execution { error_type, .. }) => {
            assert_eq!(error_type, "missing_dependency")
        }
        other => panic!("expected execution error, got {:?}", other.map(|o| o.outputs)),
    }
    assert_eq!(installer.installed.lock().unwrap().len(), 1);
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn test_component_error_is_not_retried() {
    let src = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let bus = EventBus::new(100);
    let component = shell_component(src.path(), "fails", "echo oops >&2\nexit 3\n")
        .with_requirement("fake-pkg");
    let installer = Arc::new(RecordingInstaller::default());

    let result = executor_with(work.path(), installer.clone())
        .run(create_test_context(component, &bus))
        .await;

    match result {
        Err(NodeError::Execution {
            error_type,
            message,
            ..
        }) => {
            assert_eq!(error_type, "component_error");
            assert!(message.contains("status 3"), "{}", message);
        }
        other => panic!("expected execution error, got {:?}", other.map(|o| o.outputs)),
    }
    assert!(installer.installed.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_component_written_error_file_is_kept() {
    let src = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let bus = EventBus::new(100);
    let component = shell_component(
        src.path(),
        "typed",
        "printf '{\"error_message\": \"bad input\", \"traceback_text\": \"line 1\", \"error_type\": \"ValueError\"}' > \"$WEFT_ERROR_FILE\"\nexit 1\n",
    );

    let result = executor(work.path())
        .run(create_test_context(component, &bus))
        .await;

    assert_eq!(
        result.err(),
        Some(NodeError::Execution {
            message: "bad input".to_string(),
            traceback: "line 1".to_string(),
            error_type: "ValueError".to_string(),
        })
    );
}

#[tokio::test]
async fn test_missing_result_is_unknown_failure() {
    let src = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let bus = EventBus::new(100);
    let component = shell_component(src.path(), "silent", "true\n");

    let result = executor(work.path())
        .run(create_test_context(component, &bus))
        .await;

    assert!(matches!(result, Err(NodeError::UnknownFailure(_))));
}

/// Component that backgrounds a long sleep, records its pid and waits.
fn forking_sleeper(dir: &Path) -> (ComponentSpec, PathBuf) {
    let pid_file = dir.join("sleeper.pid");
    let body = format!("sleep 30 &\necho $! > '{}'\nwait\n", pid_file.display());
    (shell_component(dir, "sleeper", &body), pid_file)
}

/// Live (non-zombie) process check through procfs.
#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => stat
            .rsplit_once(')')
            .is_some_and(|(_, rest)| !rest.trim_start().starts_with('Z')),
        Err(_) => false,
    }
}

#[cfg(target_os = "linux")]
async fn assert_process_gone(pid_file: &Path) {
    let pid: u32 = std::fs::read_to_string(pid_file)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    for _ in 0..50 {
        if !process_alive(pid) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("forked component process {} outlived its node", pid);
}

#[tokio::test]
async fn test_timeout_terminates_child() {
    let src = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let bus = EventBus::new(100);
    let (component, pid_file) = forking_sleeper(src.path());
    let mut ctx = create_test_context(component, &bus);
    ctx.timeout = Duration::from_millis(300);

    let started = Instant::now();
    let result = executor(work.path()).run(ctx).await;

    assert!(matches!(result, Err(NodeError::Timeout { millis: 300 })));
    assert!(started.elapsed() < Duration::from_secs(10));
    #[cfg(target_os = "linux")]
    assert_process_gone(&pid_file).await;
    #[cfg(not(target_os = "linux"))]
    let _ = pid_file;
}

#[tokio::test]
async fn test_cancellation_terminates_child() {
    let src = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let bus = EventBus::new(100);
    let (component, pid_file) = forking_sleeper(src.path());
    let ctx = create_test_context(component, &bus);
    let token = ctx.cancellation.clone();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        token.cancel();
    });

    let started = Instant::now();
    let result = executor(work.path()).run(ctx).await;

    assert!(matches!(result, Err(NodeError::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(10));
    #[cfg(target_os = "linux")]
    assert_process_gone(&pid_file).await;
    #[cfg(not(target_os = "linux"))]
    let _ = pid_file;
}

// ============================================================================
// Templates and registration
// ============================================================================

#[tokio::test]
async fn test_python_entry_script_rendering() {
    let work = tempfile::tempdir().unwrap();
    let files = RunFiles::create(work.path(), "math/add||adder", "entry.py")
        .await
        .unwrap();
    let component = ComponentSpec::new("math/add", "python", "/components/add.py");

    let script = PythonTemplate.render(&component, Path::new("/components/add.py"), &files);

    assert!(script.contains(r#"ENTRY = "Component""#));
    assert!(script.contains(r#"SOURCE_FILE = "/components/add.py""#));
    assert!(script.contains(&format!(
        "TRANSFER_FILE = \"{}\"",
        files.transfer().display()
    )));
    assert!(script.contains("missing_dependency"));
    assert!(!script.contains("@@"));
}

#[test]
fn test_register_all_provides_python_and_shell() {
    let mut registry = RunnerRegistry::new();
    weftnodes::register_all(&mut registry, &RuntimeConfig::default());

    assert!(registry.get("python").is_ok());
    assert!(registry.get("shell").is_ok());
}
