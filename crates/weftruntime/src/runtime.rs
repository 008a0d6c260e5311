use crate::{
    validate_batch, validate_workflow, BatchReport, ComponentRegistry, NodeDispatcher,
    RunCoordinator, RunHandle, RunRequest, RunState, RunnerRegistry, RuntimeConfig, Scheduler,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use weftcore::{EventBus, FlowError, NodeId, Workflow, WorkflowError, WorkflowId};

/// Which part of the graph a batch covers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "target", content = "node", rename_all = "snake_case")]
pub enum RunTarget {
    #[default]
    Full,
    /// The node and everything it depends on
    UpTo(NodeId),
    /// The node and everything depending on it
    From(NodeId),
    Only(NodeId),
}

/// Main runtime for executing workflows
pub struct WeftRuntime {
    components: Arc<ComponentRegistry>,
    runners: Arc<RunnerRegistry>,
    config: RuntimeConfig,
    coordinator: RunCoordinator,
    event_bus: Arc<EventBus>,
    workflows: Arc<RwLock<HashMap<WorkflowId, Workflow>>>,
}

impl WeftRuntime {
    pub fn new(
        components: ComponentRegistry,
        runners: RunnerRegistry,
        config: RuntimeConfig,
    ) -> Self {
        let components = Arc::new(components);
        let runners = Arc::new(runners);
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));
        let dispatcher = Arc::new(NodeDispatcher::new(
            components.clone(),
            runners.clone(),
            config.clone(),
        ));

        Self {
            components,
            runners,
            coordinator: RunCoordinator::new(dispatcher, event_bus.clone()),
            config,
            event_bus,
            workflows: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn components(&self) -> &Arc<ComponentRegistry> {
        &self.components
    }

    pub fn runners(&self) -> &Arc<RunnerRegistry> {
        &self.runners
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Compute and validate the batch for `target`. Cycles, unknown
    /// components, fan-in on single inputs and malformed regions are
    /// reported here, before any node runs.
    pub fn plan(&self, workflow: &Workflow, target: RunTarget) -> Result<Vec<NodeId>, FlowError> {
        validate_workflow(workflow, &self.components)?;
        let scheduler = Scheduler::new(workflow);
        let order = match target {
            RunTarget::Full => scheduler.full_order()?,
            RunTarget::UpTo(node) => scheduler.ancestors_order(node)?,
            RunTarget::From(node) => scheduler.descendants_order(node)?,
            RunTarget::Only(node) => scheduler.order(&[node])?,
        };
        validate_batch(workflow, &order, &self.components, &self.runners)?;
        tracing::debug!("Planned {} node(s) for '{}'", order.len(), workflow.name);
        Ok(order)
    }

    /// Start a batch on a background task and return immediately.
    pub fn start(
        &self,
        workflow: &Workflow,
        target: RunTarget,
        interpreter: impl Into<PathBuf>,
    ) -> Result<RunHandle, FlowError> {
        let order = self.plan(workflow, target)?;
        let request = RunRequest {
            workflow: Arc::new(workflow.clone()),
            order,
            interpreter: interpreter.into(),
            state: RunState::from_workflow(workflow),
        };
        Ok(self.coordinator.spawn(request))
    }

    /// Run a batch to completion and write its statuses, outputs and
    /// variables back into `workflow`.
    pub async fn run(
        &self,
        workflow: &mut Workflow,
        target: RunTarget,
        interpreter: impl Into<PathBuf>,
    ) -> Result<BatchReport, FlowError> {
        let report = self.start(workflow, target, interpreter)?.wait().await?;
        report.state.apply_to(workflow);
        Ok(report)
    }

    /// Register a workflow
    pub async fn register_workflow(&self, workflow: Workflow) -> WorkflowId {
        let id = workflow.id;
        let mut workflows = self.workflows.write().await;
        workflows.insert(id, workflow);
        id
    }

    pub async fn get_workflow(&self, id: WorkflowId) -> Option<Workflow> {
        self.workflows.read().await.get(&id).cloned()
    }

    pub async fn list_workflows(&self) -> Vec<Workflow> {
        self.workflows.read().await.values().cloned().collect()
    }

    pub async fn remove_workflow(&self, id: WorkflowId) -> Option<Workflow> {
        self.workflows.write().await.remove(&id)
    }

    /// Start a registered workflow by ID
    pub async fn start_workflow(
        &self,
        id: WorkflowId,
        target: RunTarget,
        interpreter: impl Into<PathBuf>,
    ) -> Result<RunHandle, FlowError> {
        let workflows = self.workflows.read().await;
        let workflow = workflows
            .get(&id)
            .ok_or_else(|| WorkflowError::NotFound(id.to_string()))?;
        self.start(workflow, target, interpreter)
    }

    /// Run a registered workflow by ID and store the resulting state.
    pub async fn execute_workflow(
        &self,
        id: WorkflowId,
        target: RunTarget,
        interpreter: impl Into<PathBuf>,
    ) -> Result<BatchReport, FlowError> {
        let report = self
            .start_workflow(id, target, interpreter)
            .await?
            .wait()
            .await?;
        if let Some(workflow) = self.workflows.write().await.get_mut(&id) {
            report.state.apply_to(workflow);
        }
        Ok(report)
    }

    /// Subscribe to execution events
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<weftcore::ExecutionEvent> {
        self.event_bus.subscribe()
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }
}
