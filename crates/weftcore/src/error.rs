use crate::NodeId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Node {node_id} failed: {source}")]
    Node {
        node_id: NodeId,
        #[source]
        source: NodeError,
    },

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FlowError {
    pub fn node(node_id: NodeId, source: NodeError) -> Self {
        FlowError::Node { node_id, source }
    }

    /// The failing node, when the error came from one.
    pub fn node_id(&self) -> Option<NodeId> {
        match self {
            FlowError::Node { node_id, .. } => Some(*node_id),
            _ => None,
        }
    }

    pub fn node_error(&self) -> Option<&NodeError> {
        match self {
            FlowError::Node { source, .. } => Some(source),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.node_error(), Some(NodeError::Cancelled))
    }
}

/// Failures raised while running a single node.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NodeError {
    #[error("Missing required input: {0}")]
    MissingInput(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("{error_type}: {message}")]
    Execution {
        message: String,
        traceback: String,
        error_type: String,
    },

    #[error("Unknown failure: {0}")]
    UnknownFailure(String),

    #[error("Timed out after {millis}ms")]
    Timeout { millis: u64 },

    #[error("Cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(String),
}

impl NodeError {
    pub fn execution(message: impl Into<String>) -> Self {
        NodeError::Execution {
            message: message.into(),
            traceback: String::new(),
            error_type: "execution_error".to_string(),
        }
    }
}

impl From<std::io::Error> for NodeError {
    fn from(err: std::io::Error) -> Self {
        NodeError::Io(err.to_string())
    }
}

/// Scheduling and configuration failures. These are raised before any
/// node of the affected batch runs.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkflowError {
    #[error("Workflow not found: {0}")]
    NotFound(String),

    #[error("Invalid workflow: {0}")]
    Invalid(String),

    #[error("Cyclic dependency detected among {} node(s)", .nodes.len())]
    CyclicDependency { nodes: Vec<NodeId> },

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Unknown component: {0}")]
    UnknownComponent(String),

    #[error("No runner registered for runtime '{0}'")]
    UnknownRuntime(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid connection: {0}")]
    InvalidConnection(String),
}
