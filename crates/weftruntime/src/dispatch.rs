use crate::region::{RegionExecutor, REGION_OUTPUT_PORT};
use crate::{ComponentRegistry, ExpressionEngine, RunState, RunnerRegistry, RuntimeConfig};
use chrono::Utc;
use futures::future::BoxFuture;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use weftcore::{
    sanitize_identifier, BranchCondition, EventBus, ExecutionEvent, ExecutionId, FlowError,
    NodeContext, NodeError, NodeId, NodeKind, NodeSpec, NodeStatus, Outputs, Value, Workflow,
    WorkflowError,
};

pub(crate) const ELSE_PORT: &str = "else";
const BRANCH_INPUT_PORT: &str = "input";

/// Per-batch values every node execution needs
#[derive(Clone)]
pub struct RunScope {
    pub execution_id: ExecutionId,
    pub interpreter: PathBuf,
    pub cancellation: CancellationToken,
    pub events: Arc<EventBus>,
}

/// Executes a single node of any kind against the batch state
pub struct NodeDispatcher {
    components: Arc<ComponentRegistry>,
    runners: Arc<RunnerRegistry>,
    config: RuntimeConfig,
}

impl NodeDispatcher {
    pub fn new(
        components: Arc<ComponentRegistry>,
        runners: Arc<RunnerRegistry>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            components,
            runners,
            config,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub(crate) fn expressions(&self, state: &RunState) -> ExpressionEngine {
        ExpressionEngine::new(&state.variables).with_budget(self.config.expression_budget())
    }

    /// Mark `node` skipped if a branch disabled it or all its feeders were
    /// skipped. Returns whether it was skipped.
    pub fn skip_if_inactive(
        &self,
        workflow: &Workflow,
        node_id: NodeId,
        state: &mut RunState,
        scope: &RunScope,
    ) -> bool {
        if !state.should_skip(workflow, node_id) {
            return false;
        }
        state.mark_skipped(node_id);
        tracing::info!("Skipping inactive node {}", node_id);
        scope.events.emit(ExecutionEvent::NodeSkipped {
            execution_id: scope.execution_id,
            node_id,
            timestamp: Utc::now(),
        });
        emit_status(scope, node_id, NodeStatus::Unrun);
        true
    }

    /// Run one node: a component through its runner, a region through the
    /// region executor, a branch in-process. On success the outputs are
    /// stored and written into the node-output variable scope.
    pub fn execute<'a>(
        &'a self,
        workflow: &'a Workflow,
        node_id: NodeId,
        state: &'a mut RunState,
        scope: &'a RunScope,
    ) -> BoxFuture<'a, Result<Outputs, FlowError>> {
        Box::pin(async move {
            let node = workflow
                .find_node(node_id)
                .ok_or_else(|| WorkflowError::NodeNotFound(node_id.to_string()))?;

            if scope.cancellation.is_cancelled() {
                return Err(FlowError::node(node_id, NodeError::Cancelled));
            }

            self.set_status(state, scope, node_id, NodeStatus::Running);

            let result = match &node.kind {
                NodeKind::Component { component_id } => {
                    self.run_component(workflow, node, component_id, state, scope)
                        .await
                }
                NodeKind::Region { .. } => RegionExecutor::new(self)
                    .execute(workflow, node, state, scope)
                    .await
                    .map(|value| HashMap::from([(REGION_OUTPUT_PORT.to_string(), value)])),
                NodeKind::Branch {
                    conditions,
                    enable_else,
                } => Ok(self.run_branch(workflow, node, conditions, *enable_else, state)),
                NodeKind::InputProxy | NodeKind::OutputProxy => {
                    Err(FlowError::Workflow(WorkflowError::Configuration(format!(
                        "proxy node '{}' can only run inside a region",
                        node.name
                    ))))
                }
            };

            match result {
                Ok(outputs) => {
                    self.record_success(node, &outputs, state, scope);
                    Ok(outputs)
                }
                Err(err) => {
                    self.set_status(state, scope, node_id, NodeStatus::Failed);
                    Err(err)
                }
            }
        })
    }

    async fn run_component(
        &self,
        workflow: &Workflow,
        node: &NodeSpec,
        component_id: &str,
        state: &RunState,
        scope: &RunScope,
    ) -> Result<Outputs, FlowError> {
        let component = self.components.lookup(component_id)?;
        let runner = self.runners.get(&component.runtime)?;

        let raw_inputs = state.gather_inputs(workflow, node);
        let engine = self.expressions(state);
        let locals = input_locals(&raw_inputs);

        let mut params = component.param_defaults();
        params.extend(node.params.iter().map(|(k, v)| (k.clone(), v.clone())));
        let params = resolve_map(&engine, &params, &locals);
        let inputs = resolve_map(&engine, &raw_inputs, &locals);

        for port in component.inputs.iter().filter(|p| p.required) {
            if inputs.get(&port.name).map_or(true, Value::is_null) {
                return Err(FlowError::node(
                    node.id,
                    NodeError::MissingInput(port.name.clone()),
                ));
            }
        }

        let timeout = workflow
            .settings
            .node_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.node_timeout());

        let ctx = NodeContext {
            node_id: node.id,
            stable_key: node.stable_key(),
            component: component.clone(),
            params,
            inputs,
            variables: engine.variables().clone(),
            interpreter: scope.interpreter.clone(),
            timeout,
            events: scope.events.create_emitter(scope.execution_id, node.id),
            cancellation: scope.cancellation.clone(),
        };

        tracing::info!(
            "Running node '{}' ({} via {})",
            node.name,
            component.id,
            runner.runtime()
        );
        let output = runner
            .run(ctx)
            .await
            .map_err(|e| FlowError::node(node.id, e))?;
        tracing::debug!(
            "Node '{}' finished in {}ms after {} attempt(s)",
            node.name,
            output.metadata.execution_time_ms,
            output.metadata.attempts
        );
        Ok(output.outputs)
    }

    /// Evaluate conditions in order; the first that holds activates its
    /// port. Targets reachable only through inactive ports are disabled.
    fn run_branch(
        &self,
        workflow: &Workflow,
        node: &NodeSpec,
        conditions: &[BranchCondition],
        enable_else: bool,
        state: &mut RunState,
    ) -> Outputs {
        let raw_inputs = state.gather_inputs(workflow, node);
        let engine = self.expressions(state);
        let locals = input_locals(&raw_inputs);
        let inputs = resolve_map(&engine, &raw_inputs, &locals);

        let active = conditions
            .iter()
            .find(|c| engine.evaluate_condition(&c.expression, &locals))
            .map(|c| sanitize_identifier(&c.name))
            .or_else(|| enable_else.then(|| ELSE_PORT.to_string()));

        let mut active_targets = HashSet::new();
        let mut inactive_targets = Vec::new();
        for conn in workflow.outgoing(node.id) {
            if Some(sanitize_identifier(&conn.from_port)) == active {
                active_targets.insert(conn.to_node);
            } else {
                inactive_targets.push(conn.to_node);
            }
        }
        for target in inactive_targets {
            if !active_targets.contains(&target) {
                state.disable(target);
            }
        }

        tracing::info!(
            "Branch '{}' activated {}",
            node.name,
            active.as_deref().unwrap_or("no port")
        );

        let payload = match inputs.get(BRANCH_INPUT_PORT) {
            Some(value) => value.clone(),
            None if inputs.len() == 1 => inputs.values().next().cloned().unwrap_or_default(),
            None => Value::Object(inputs),
        };
        active
            .map(|port| HashMap::from([(port, payload)]))
            .unwrap_or_default()
    }

    fn record_success(
        &self,
        node: &NodeSpec,
        outputs: &Outputs,
        state: &mut RunState,
        scope: &RunScope,
    ) {
        state.set_outputs(node.id, outputs.clone());
        self.set_status(state, scope, node.id, NodeStatus::Success);
        for (key, value) in state.variables.record_outputs(&node.name, outputs) {
            scope.events.emit(ExecutionEvent::VariableUpdated {
                execution_id: scope.execution_id,
                name: format!("node_{}", key),
                value,
                timestamp: Utc::now(),
            });
        }
    }

    pub(crate) fn set_status(
        &self,
        state: &mut RunState,
        scope: &RunScope,
        node_id: NodeId,
        status: NodeStatus,
    ) {
        state.set_status(node_id, status);
        emit_status(scope, node_id, status);
    }
}

pub(crate) fn emit_status(scope: &RunScope, node_id: NodeId, status: NodeStatus) {
    scope.events.emit(ExecutionEvent::NodeStatusChanged {
        execution_id: scope.execution_id,
        node_id,
        status,
        timestamp: Utc::now(),
    });
}

/// `input_<port>` locals for expression resolution.
pub(crate) fn input_locals(inputs: &HashMap<String, Value>) -> HashMap<String, Value> {
    inputs
        .iter()
        .map(|(port, value)| (format!("input_{}", sanitize_identifier(port)), value.clone()))
        .collect()
}

fn resolve_map(
    engine: &ExpressionEngine,
    values: &HashMap<String, Value>,
    locals: &HashMap<String, Value>,
) -> HashMap<String, Value> {
    values
        .iter()
        .map(|(name, value)| (name.clone(), engine.resolve(value, locals)))
        .collect()
}
