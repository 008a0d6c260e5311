use crate::{NodeDispatcher, RunScope, RunState};
use chrono::Utc;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use weftcore::{
    EventBus, ExecutionEvent, ExecutionId, FlowError, NodeId, NodeStatus, Outputs, Workflow,
};

/// One batch to run: a graph snapshot and the order produced for it
pub struct RunRequest {
    pub workflow: Arc<Workflow>,
    pub order: Vec<NodeId>,
    pub interpreter: PathBuf,
    pub state: RunState,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BatchOutcome {
    Completed,
    Failed { node_id: NodeId, error: String },
    Cancelled,
}

/// Final result of a batch
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub execution_id: ExecutionId,
    pub outcome: BatchOutcome,
    pub state: RunState,
    /// Nodes that finished successfully, in execution order.
    pub completed: Vec<NodeId>,
    pub duration_ms: u64,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.outcome == BatchOutcome::Completed
    }

    pub fn outputs_of(&self, node: NodeId) -> Option<&Outputs> {
        self.state.outputs.get(&node)
    }

    pub fn status_of(&self, node: NodeId) -> NodeStatus {
        self.state.status(node)
    }
}

/// Drives scheduled batches on background tasks
pub struct RunCoordinator {
    dispatcher: Arc<NodeDispatcher>,
    events: Arc<EventBus>,
}

impl RunCoordinator {
    pub fn new(dispatcher: Arc<NodeDispatcher>, events: Arc<EventBus>) -> Self {
        Self { dispatcher, events }
    }

    /// Start a batch without waiting for it.
    pub fn spawn(&self, request: RunRequest) -> RunHandle {
        let execution_id = ExecutionId::new_v4();
        let cancellation = CancellationToken::new();
        let scope = RunScope {
            execution_id,
            interpreter: request.interpreter.clone(),
            cancellation: cancellation.clone(),
            events: self.events.clone(),
        };
        let task = tokio::spawn(drive(self.dispatcher.clone(), request, scope));
        RunHandle {
            execution_id,
            cancellation,
            task,
        }
    }
}

/// Handle to a running batch
pub struct RunHandle {
    execution_id: ExecutionId,
    cancellation: CancellationToken,
    task: JoinHandle<BatchReport>,
}

impl RunHandle {
    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    /// Request cancellation. Nodes not yet started never start; the running
    /// node's child process is terminated.
    pub fn cancel(&self) {
        tracing::info!("Cancelling execution {}", self.execution_id);
        self.cancellation.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn wait(self) -> Result<BatchReport, FlowError> {
        self.task
            .await
            .map_err(|e| FlowError::Execution(format!("run task failed: {}", e)))
    }
}

async fn drive(
    dispatcher: Arc<NodeDispatcher>,
    request: RunRequest,
    scope: RunScope,
) -> BatchReport {
    let RunRequest {
        workflow,
        order,
        mut state,
        ..
    } = request;
    let started = Instant::now();
    state.variables.env.run_id = scope.execution_id.to_string();

    tracing::info!(
        "Starting execution {} of '{}' ({} node(s))",
        scope.execution_id,
        workflow.name,
        order.len()
    );
    scope.events.emit(ExecutionEvent::BatchStarted {
        execution_id: scope.execution_id,
        workflow_id: workflow.id,
        nodes: order.clone(),
        timestamp: Utc::now(),
    });

    state.clear_marks(order.iter());
    for id in &order {
        dispatcher.set_status(&mut state, &scope, *id, NodeStatus::Pending);
    }

    let mut completed = Vec::new();
    let mut outcome = BatchOutcome::Completed;

    for node_id in &order {
        if scope.cancellation.is_cancelled() {
            outcome = BatchOutcome::Cancelled;
            break;
        }
        if dispatcher.skip_if_inactive(&workflow, *node_id, &mut state, &scope) {
            continue;
        }

        let node_kind = workflow
            .find_node(*node_id)
            .map(|n| n.kind.label())
            .unwrap_or("unknown");
        scope.events.emit(ExecutionEvent::NodeStarted {
            execution_id: scope.execution_id,
            node_id: *node_id,
            node_kind: node_kind.to_string(),
            timestamp: Utc::now(),
        });

        let node_started = Instant::now();
        match dispatcher
            .execute(&workflow, *node_id, &mut state, &scope)
            .await
        {
            Ok(outputs) => {
                scope.events.emit(ExecutionEvent::NodeFinished {
                    execution_id: scope.execution_id,
                    node_id: *node_id,
                    outputs,
                    duration_ms: node_started.elapsed().as_millis() as u64,
                    timestamp: Utc::now(),
                });
                completed.push(*node_id);
            }
            Err(err) => {
                scope.events.emit(ExecutionEvent::NodeFailed {
                    execution_id: scope.execution_id,
                    node_id: *node_id,
                    error: err.to_string(),
                    timestamp: Utc::now(),
                });
                outcome = if err.is_cancelled() || scope.cancellation.is_cancelled() {
                    tracing::warn!("Node {} cancelled", node_id);
                    BatchOutcome::Cancelled
                } else {
                    tracing::error!("Node {} failed: {}", node_id, err);
                    BatchOutcome::Failed {
                        node_id: *node_id,
                        error: err.to_string(),
                    }
                };
                break;
            }
        }
    }

    // anything still queued goes back to unrun
    for id in &order {
        if state.status(*id) == NodeStatus::Pending {
            dispatcher.set_status(&mut state, &scope, *id, NodeStatus::Unrun);
        }
    }

    let duration_ms = started.elapsed().as_millis() as u64;
    let terminal = match &outcome {
        BatchOutcome::Completed => {
            tracing::info!(
                "Execution {} completed in {}ms",
                scope.execution_id,
                duration_ms
            );
            ExecutionEvent::BatchCompleted {
                execution_id: scope.execution_id,
                duration_ms,
                timestamp: Utc::now(),
            }
        }
        BatchOutcome::Failed { node_id, error } => ExecutionEvent::BatchFailed {
            execution_id: scope.execution_id,
            node_id: Some(*node_id),
            error: error.clone(),
            cancelled: false,
            duration_ms,
            timestamp: Utc::now(),
        },
        BatchOutcome::Cancelled => ExecutionEvent::BatchFailed {
            execution_id: scope.execution_id,
            node_id: None,
            error: "cancelled".to_string(),
            cancelled: true,
            duration_ms,
            timestamp: Utc::now(),
        },
    };
    scope.events.emit(terminal);

    BatchReport {
        execution_id: scope.execution_id,
        outcome,
        state,
        completed,
        duration_ms,
    }
}
