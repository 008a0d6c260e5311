// crates/weftcli/src/main.rs

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use weftcore::{
    ComponentSpec, CustomVariable, ExecutionEvent, NodeEvent, NodeId, NodeSpec, PortSpec, Workflow,
    WorkflowDocument,
};
use weftruntime::{
    validate_workflow, ComponentLoader, ComponentRegistry, ExpressionEngine, RunTarget,
    RunnerRegistry, RuntimeConfig, WeftRuntime,
};

const DEFAULT_INTERPRETER: &str = "python3";

#[derive(Parser)]
#[command(name = "weft")]
#[command(about = "Weft workflow engine CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow document
    Run {
        /// Path to the workflow document
        file: PathBuf,

        /// Interpreter used to launch components
        #[arg(short, long)]
        interpreter: Option<PathBuf>,

        #[command(flatten)]
        components: ComponentArgs,

        #[command(flatten)]
        target: TargetArgs,

        /// Runtime configuration file (JSON)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Write statuses and outputs back into the document
        #[arg(long)]
        save: bool,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Validate a workflow document
    Validate {
        file: PathBuf,

        #[command(flatten)]
        components: ComponentArgs,
    },

    /// Print the execution order
    Order {
        file: PathBuf,

        #[command(flatten)]
        components: ComponentArgs,

        #[command(flatten)]
        target: TargetArgs,
    },

    /// List component manifests
    Components {
        #[command(flatten)]
        components: ComponentArgs,
    },

    /// Evaluate an expression against a document's variables
    Eval {
        expr: String,

        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Create an example workflow with a shell component
    Init {
        /// Output directory
        #[arg(default_value = ".")]
        output: PathBuf,
    },
}

#[derive(Args)]
struct ComponentArgs {
    /// Directory searched for *.component.json manifests
    #[arg(short, long, default_value = "components")]
    components: PathBuf,
}

#[derive(Args)]
#[group(multiple = false)]
struct TargetArgs {
    /// Run a node and everything it depends on
    #[arg(long)]
    to: Option<String>,

    /// Run a node and everything downstream of it
    #[arg(long)]
    from: Option<String>,

    /// Run a single node
    #[arg(long)]
    only: Option<String>,
}

impl TargetArgs {
    fn resolve(&self, workflow: &Workflow) -> Result<RunTarget> {
        Ok(match (&self.to, &self.from, &self.only) {
            (Some(node), _, _) => RunTarget::UpTo(find_node(workflow, node)?),
            (_, Some(node), _) => RunTarget::From(find_node(workflow, node)?),
            (_, _, Some(node)) => RunTarget::Only(find_node(workflow, node)?),
            _ => RunTarget::Full,
        })
    }
}

/// Accepts a node UUID or a node name.
fn find_node(workflow: &Workflow, reference: &str) -> Result<NodeId> {
    if let Ok(id) = reference.parse::<NodeId>() {
        if workflow.find_node(id).is_some() {
            return Ok(id);
        }
    }
    match workflow.find_by_name(reference) {
        Some(node) => Ok(node.id),
        None => bail!("No node named or identified by '{}'", reference),
    }
}

fn load_document(path: &Path) -> Result<WorkflowDocument> {
    WorkflowDocument::load(path)
        .with_context(|| format!("Failed to load workflow document {}", path.display()))
}

fn load_components(dir: &Path) -> Result<ComponentRegistry> {
    let mut registry = ComponentRegistry::new();
    if dir.is_dir() {
        ComponentLoader::new(dir)
            .load_into(&mut registry)
            .with_context(|| format!("Failed to load components from {}", dir.display()))?;
    } else {
        tracing::warn!("Component directory {} does not exist", dir.display());
    }
    Ok(registry)
}

fn build_runtime(components: &Path, config: RuntimeConfig) -> Result<WeftRuntime> {
    let registry = load_components(components)?;
    let mut runners = RunnerRegistry::new();
    weftnodes::register_all(&mut runners, &config);
    Ok(WeftRuntime::new(registry, runners, config))
}

fn node_label(workflow: &Workflow, id: NodeId) -> String {
    workflow
        .find_node(id)
        .map(|node| node.name.clone())
        .unwrap_or_else(|| id.to_string())
}

fn print_event(workflow: &Workflow, event: &ExecutionEvent, verbose: bool) {
    match event {
        ExecutionEvent::BatchStarted { nodes, .. } => {
            println!("🚀 Running {} node(s)", nodes.len());
        }
        ExecutionEvent::NodeStarted {
            node_id, node_kind, ..
        } => {
            println!("▶️  {} ({})", node_label(workflow, *node_id), node_kind);
        }
        ExecutionEvent::NodeFinished {
            node_id,
            duration_ms,
            outputs,
            ..
        } => {
            println!("✅ {} ({}ms)", node_label(workflow, *node_id), duration_ms);
            if verbose {
                for (port, value) in outputs {
                    println!("     {} = {}", port, value);
                }
            }
        }
        ExecutionEvent::NodeFailed { node_id, error, .. } => {
            println!("❌ {}: {}", node_label(workflow, *node_id), error);
        }
        ExecutionEvent::NodeSkipped { node_id, .. } => {
            println!("⏭️  {} skipped", node_label(workflow, *node_id));
        }
        ExecutionEvent::RegionProgress {
            region_id,
            iteration,
            total,
            ..
        } => {
            if verbose {
                let total = total.map(|t| t.to_string()).unwrap_or_else(|| "?".into());
                println!(
                    "🔁 {} iteration {}/{}",
                    node_label(workflow, *region_id),
                    iteration,
                    total
                );
            }
        }
        ExecutionEvent::NodeEvent { node_id, event, .. } => match event {
            NodeEvent::Log { text } if verbose => {
                println!("   [{}] {}", node_label(workflow, *node_id), text);
            }
            NodeEvent::Warning { message } => {
                println!("⚠️  {}: {}", node_label(workflow, *node_id), message);
            }
            NodeEvent::Info { message } if verbose => {
                println!("ℹ️  {}: {}", node_label(workflow, *node_id), message);
            }
            _ => {}
        },
        ExecutionEvent::BatchCompleted { duration_ms, .. } => {
            println!("🎉 Batch completed in {}ms", duration_ms);
        }
        ExecutionEvent::BatchFailed {
            error, cancelled, ..
        } => {
            if *cancelled {
                println!("🛑 Batch cancelled");
            } else {
                println!("💥 Batch failed: {}", error);
            }
        }
        ExecutionEvent::NodeStatusChanged { .. } | ExecutionEvent::VariableUpdated { .. } => {}
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_command(
    file: PathBuf,
    interpreter: Option<PathBuf>,
    components: PathBuf,
    target: TargetArgs,
    config: Option<PathBuf>,
    save: bool,
    verbose: bool,
) -> Result<()> {
    let mut doc = load_document(&file)?;
    println!("📄 Loaded workflow: {}", doc.graph.name);

    let config = match config {
        Some(path) => RuntimeConfig::load(&path)
            .with_context(|| format!("Failed to read config {}", path.display()))?,
        None => RuntimeConfig::default(),
    }
    .with_env_overrides();

    let interpreter = interpreter
        .or_else(|| doc.runtime.interpreter_path.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_INTERPRETER));
    let target = target.resolve(&doc.graph)?;
    let runtime = build_runtime(&components, config)?;

    let mut events = runtime.subscribe_events();
    let snapshot = doc.graph.clone();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            print_event(&snapshot, &event, verbose);
            if event.is_terminal() {
                break;
            }
        }
    });

    let report = runtime.run(&mut doc.graph, target, &interpreter).await;
    if report.is_ok() {
        // the terminal event ends the printer
        let _ = printer.await;
    } else {
        printer.abort();
    }
    let report = report.context("Workflow could not be started")?;

    if save {
        doc.runtime.interpreter_path = Some(interpreter);
        doc.save(&file)
            .with_context(|| format!("Failed to save {}", file.display()))?;
        println!("💾 Saved {}", file.display());
    }

    if !report.is_success() {
        bail!("{} of {} node(s) completed", report.completed.len(), doc.graph.nodes.len());
    }
    Ok(())
}

fn validate_command(file: PathBuf, components: PathBuf) -> Result<()> {
    let doc = load_document(&file)?;
    let runtime = build_runtime(&components, RuntimeConfig::default())?;

    validate_workflow(&doc.graph, runtime.components()).context("Workflow is malformed")?;
    let order = runtime
        .plan(&doc.graph, RunTarget::Full)
        .context("Workflow cannot be scheduled")?;

    println!("✅ Workflow is valid!");
    println!("   Name: {}", doc.graph.name);
    println!("   Nodes: {}", doc.graph.nodes.len());
    println!("   Connections: {}", doc.graph.connections.len());
    println!("   Batch size: {}", order.len());
    Ok(())
}

fn order_command(file: PathBuf, components: PathBuf, target: TargetArgs) -> Result<()> {
    let doc = load_document(&file)?;
    let runtime = build_runtime(&components, RuntimeConfig::default())?;
    let target = target.resolve(&doc.graph)?;
    let order = runtime.plan(&doc.graph, target)?;

    for (i, id) in order.iter().enumerate() {
        let kind = doc
            .graph
            .find_node(*id)
            .map(|node| node.kind.label())
            .unwrap_or("?");
        println!("{:>3}. {} [{}] {}", i + 1, node_label(&doc.graph, *id), kind, id);
    }
    Ok(())
}

fn components_command(components: PathBuf) -> Result<()> {
    let registry = load_components(&components)?;
    let mut specs = registry.list();
    specs.sort_by(|a, b| a.id.cmp(&b.id));

    println!("📦 {} component(s) in {}:", specs.len(), components.display());
    for spec in specs {
        let inputs: Vec<_> = spec.inputs.iter().map(|p| p.name.as_str()).collect();
        let outputs: Vec<_> = spec.outputs.iter().map(|p| p.name.as_str()).collect();
        println!("  • {} ({})", spec.id, spec.runtime);
        if !spec.description.is_empty() {
            println!("      {}", spec.description);
        }
        println!("      in: [{}] out: [{}]", inputs.join(", "), outputs.join(", "));
    }
    Ok(())
}

fn eval_command(expr: String, file: Option<PathBuf>) -> Result<()> {
    let engine = match file {
        Some(path) => {
            let doc = load_document(&path)?;
            ExpressionEngine::new(&doc.graph.variables)
        }
        None => ExpressionEngine::from_variables(Default::default()),
    };
    let value = if expr.contains("{{") {
        engine.resolve(&expr.as_str().into(), &Default::default())
    } else {
        engine.evaluate(&expr)
    };
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

const GREET_SCRIPT: &str = r#"# Reads the "name" parameter from the transfer file and writes a greeting.
name=$(sed -n 's/.*"name":"\([^"]*\)".*/\1/p' "$WEFT_TRANSFER_FILE")
echo "greeting $name"
printf '{"greeting":"Hello, %s!"}' "$name" >"$WEFT_RESULT_FILE"
"#;

fn greet_component() -> ComponentSpec {
    let mut greet = ComponentSpec::new("greet", "shell", "greet.sh")
        .with_output(PortSpec::new("greeting").typed("string"));
    greet.name = "Greet".to_string();
    greet.description = "Greets the configured user".to_string();
    greet
}

fn example_workflow() -> Workflow {
    let mut workflow = Workflow::new("Example Workflow");
    workflow.description = Some("A single shell component greeting a user".to_string());
    workflow
        .variables
        .define_custom("user", CustomVariable::new("world"));
    workflow.add_node(
        NodeSpec::component("greet")
            .with_name("greeter")
            .with_param("name", "{{ custom_user }}")
            .with_position(100.0, 100.0),
    );
    workflow
}

fn init_command(output: PathBuf) -> Result<()> {
    let component_dir = output.join("components");
    std::fs::create_dir_all(&component_dir)
        .with_context(|| format!("Failed to create {}", component_dir.display()))?;

    std::fs::write(component_dir.join("greet.sh"), GREET_SCRIPT)?;
    std::fs::write(
        component_dir.join("greet.component.json"),
        serde_json::to_string_pretty(&greet_component())?,
    )?;

    let path = output.join("workflow.json");
    WorkflowDocument::new(example_workflow())
        .save(&path)
        .with_context(|| format!("Failed to write {}", path.display()))?;

    println!("✅ Created example workflow: {}", path.display());
    println!("   Run it with: weft run {} -c {}", path.display(), component_dir.display());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let verbose = matches!(cli.command, Commands::Run { verbose: true, .. });
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Run {
            file,
            interpreter,
            components,
            target,
            config,
            save,
            verbose,
        } => {
            run_command(
                file,
                interpreter,
                components.components,
                target,
                config,
                save,
                verbose,
            )
            .await
        }
        Commands::Validate { file, components } => validate_command(file, components.components),
        Commands::Order {
            file,
            components,
            target,
        } => order_command(file, components.components, target),
        Commands::Components { components } => components_command(components.components),
        Commands::Eval { expr, file } => eval_command(expr, file),
        Commands::Init { output } => init_command(output),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use weftcore::Value;

    #[test]
    fn test_init_writes_a_resolvable_example() {
        let dir = tempfile::tempdir().unwrap();
        init_command(dir.path().to_path_buf()).unwrap();

        let doc = load_document(&dir.path().join("workflow.json")).unwrap();
        let registry = load_components(&dir.path().join("components")).unwrap();
        validate_workflow(&doc.graph, &registry).unwrap();

        let engine = ExpressionEngine::new(&doc.graph.variables);
        let greeter = doc.graph.find_by_name("greeter").unwrap();
        let name = engine.resolve(&greeter.params["name"], &HashMap::new());
        assert_eq!(name, Value::from("world"));
    }
}
