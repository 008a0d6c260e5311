use crate::{NodeId, NodeStatus, Value, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::broadcast;
use uuid::Uuid;

pub type ExecutionId = Uuid;

/// Events emitted while a batch runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExecutionEvent {
    BatchStarted {
        execution_id: ExecutionId,
        workflow_id: WorkflowId,
        nodes: Vec<NodeId>,
        timestamp: DateTime<Utc>,
    },
    BatchCompleted {
        execution_id: ExecutionId,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    BatchFailed {
        execution_id: ExecutionId,
        node_id: Option<NodeId>,
        error: String,
        cancelled: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    NodeStatusChanged {
        execution_id: ExecutionId,
        node_id: NodeId,
        status: NodeStatus,
        timestamp: DateTime<Utc>,
    },
    NodeStarted {
        execution_id: ExecutionId,
        node_id: NodeId,
        node_kind: String,
        timestamp: DateTime<Utc>,
    },
    NodeFinished {
        execution_id: ExecutionId,
        node_id: NodeId,
        outputs: HashMap<String, Value>,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    NodeFailed {
        execution_id: ExecutionId,
        node_id: NodeId,
        error: String,
        timestamp: DateTime<Utc>,
    },
    NodeSkipped {
        execution_id: ExecutionId,
        node_id: NodeId,
        timestamp: DateTime<Utc>,
    },
    RegionProgress {
        execution_id: ExecutionId,
        region_id: NodeId,
        iteration: usize,
        total: Option<usize>,
        timestamp: DateTime<Utc>,
    },
    VariableUpdated {
        execution_id: ExecutionId,
        name: String,
        value: Value,
        timestamp: DateTime<Utc>,
    },
    NodeEvent {
        execution_id: ExecutionId,
        node_id: NodeId,
        event: NodeEvent,
        timestamp: DateTime<Utc>,
    },
}

impl ExecutionEvent {
    pub fn execution_id(&self) -> ExecutionId {
        match self {
            ExecutionEvent::BatchStarted { execution_id, .. }
            | ExecutionEvent::BatchCompleted { execution_id, .. }
            | ExecutionEvent::BatchFailed { execution_id, .. }
            | ExecutionEvent::NodeStatusChanged { execution_id, .. }
            | ExecutionEvent::NodeStarted { execution_id, .. }
            | ExecutionEvent::NodeFinished { execution_id, .. }
            | ExecutionEvent::NodeFailed { execution_id, .. }
            | ExecutionEvent::NodeSkipped { execution_id, .. }
            | ExecutionEvent::RegionProgress { execution_id, .. }
            | ExecutionEvent::VariableUpdated { execution_id, .. }
            | ExecutionEvent::NodeEvent { execution_id, .. } => *execution_id,
        }
    }

    /// Batch-level completion or failure.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionEvent::BatchCompleted { .. } | ExecutionEvent::BatchFailed { .. }
        )
    }
}

/// Events raised from inside a running node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum NodeEvent {
    Info { message: String },
    Warning { message: String },
    /// Text streamed from the node's log file.
    Log { text: String },
}

/// Event emitter bound to one node of one execution
#[derive(Clone)]
pub struct EventEmitter {
    execution_id: ExecutionId,
    node_id: NodeId,
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventEmitter {
    pub fn new(
        execution_id: ExecutionId,
        node_id: NodeId,
        sender: broadcast::Sender<ExecutionEvent>,
    ) -> Self {
        Self {
            execution_id,
            node_id,
            sender,
        }
    }

    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Emit a node-specific event
    pub fn emit(&self, event: NodeEvent) {
        let _ = self.sender.send(ExecutionEvent::NodeEvent {
            execution_id: self.execution_id,
            node_id: self.node_id,
            event,
            timestamp: Utc::now(),
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(NodeEvent::Info {
            message: message.into(),
        });
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.emit(NodeEvent::Warning {
            message: message.into(),
        });
    }

    pub fn log(&self, text: impl Into<String>) {
        self.emit(NodeEvent::Log { text: text.into() });
    }
}

/// Broadcast bus shared by every execution of a runtime
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ExecutionEvent) {
        let _ = self.sender.send(event);
    }

    pub fn create_emitter(&self, execution_id: ExecutionId, node_id: NodeId) -> EventEmitter {
        EventEmitter::new(execution_id, node_id, self.sender.clone())
    }
}
