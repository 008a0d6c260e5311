use crate::{events::EventEmitter, ComponentSpec, NodeError, NodeId, Value};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Output values keyed by port name.
pub type Outputs = HashMap<String, Value>;

/// Backend that executes one component invocation.
///
/// Runners are registered per component runtime kind; the process-isolated
/// runner is the production backend.
#[async_trait]
pub trait ComponentRunner: Send + Sync {
    /// Runtime kind this runner serves (e.g. "python").
    fn runtime(&self) -> &str;

    /// Execute the component with fully resolved params and inputs.
    async fn run(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError>;
}

/// Execution context passed to a runner
#[derive(Clone)]
pub struct NodeContext {
    pub node_id: NodeId,

    /// `component_id||instance_name`
    pub stable_key: String,

    pub component: Arc<ComponentSpec>,

    /// Parameters after expression resolution
    pub params: HashMap<String, Value>,

    /// Inputs gathered from upstream nodes, after expression resolution
    pub inputs: HashMap<String, Value>,

    /// Flattened variable snapshot
    pub variables: HashMap<String, Value>,

    pub interpreter: PathBuf,

    pub timeout: Duration,

    /// Event emitter for real-time updates
    pub events: EventEmitter,

    /// Cancellation token for graceful shutdown
    pub cancellation: CancellationToken,
}

impl NodeContext {
    pub fn new(node_id: NodeId, component: Arc<ComponentSpec>, events: EventEmitter) -> Self {
        Self {
            node_id,
            stable_key: format!("{}||{}", component.id, component.name),
            component,
            params: HashMap::new(),
            inputs: HashMap::new(),
            variables: HashMap::new(),
            interpreter: PathBuf::from("python3"),
            timeout: Duration::from_secs(300),
            events,
            cancellation: CancellationToken::new(),
        }
    }

    /// Get required input or return error
    pub fn require_input(&self, name: &str) -> Result<&Value, NodeError> {
        self.inputs
            .get(name)
            .ok_or_else(|| NodeError::MissingInput(name.to_string()))
    }
}

/// Output from node execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeOutput {
    pub outputs: Outputs,
    pub metadata: NodeMetadata,
}

impl NodeOutput {
    pub fn new() -> Self {
        Self {
            outputs: HashMap::new(),
            metadata: NodeMetadata::default(),
        }
    }

    pub fn with_output(mut self, port: impl Into<String>, value: impl Into<Value>) -> Self {
        self.outputs.insert(port.into(), value.into());
        self
    }
}

impl Default for NodeOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Outputs> for NodeOutput {
    fn from(outputs: Outputs) -> Self {
        Self {
            outputs,
            metadata: NodeMetadata::default(),
        }
    }
}

/// Metadata about node execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeMetadata {
    pub execution_time_ms: u64,
    /// Launch attempts, including the retry after dependency installation.
    pub attempts: u32,
    pub run_dir: Option<PathBuf>,
}

impl Default for NodeMetadata {
    fn default() -> Self {
        Self {
            execution_time_ms: 0,
            attempts: 1,
            run_dir: None,
        }
    }
}
