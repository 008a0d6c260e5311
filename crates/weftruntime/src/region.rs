use crate::{NodeDispatcher, RunScope, RunState, Scheduler};
use chrono::Utc;
use std::collections::HashMap;
use weftcore::{
    ExecutionEvent, FlowError, NodeError, NodeId, NodeKind, NodeSpec, NodeStatus, RegionMode,
    Value, Workflow, WorkflowError,
};

pub const REGION_INPUT_PORT: &str = "input";
pub const REGION_OUTPUT_PORT: &str = "output";
/// Port the input proxy always exposes, whatever its edges use.
pub const PROXY_PORT: &str = "value";

/// Resolved structure of a region
#[derive(Debug, Clone)]
pub(crate) struct RegionLayout {
    pub input_proxy: NodeId,
    pub output_proxy: NodeId,
    pub order: Vec<NodeId>,
}

/// Runs a control-flow region: its internal order once per iteration.
pub struct RegionExecutor<'a> {
    dispatcher: &'a NodeDispatcher,
}

impl<'a> RegionExecutor<'a> {
    pub fn new(dispatcher: &'a NodeDispatcher) -> Self {
        Self { dispatcher }
    }

    /// Locate both proxies and order the members. Fails when a proxy is
    /// missing or duplicated, or when the interior has a cycle.
    pub(crate) fn layout(
        workflow: &Workflow,
        region: &NodeSpec,
    ) -> Result<RegionLayout, WorkflowError> {
        let NodeKind::Region { members, .. } = &region.kind else {
            return Err(WorkflowError::Configuration(format!(
                "node '{}' is not a control-flow region",
                region.name
            )));
        };

        let mut input_proxies = Vec::new();
        let mut output_proxies = Vec::new();
        for id in members {
            let member = workflow
                .find_node(*id)
                .ok_or_else(|| WorkflowError::NodeNotFound(id.to_string()))?;
            match member.kind {
                NodeKind::InputProxy => input_proxies.push(*id),
                NodeKind::OutputProxy => output_proxies.push(*id),
                _ => {}
            }
        }

        let input_proxy = single_proxy(region, input_proxies, "input proxy")?;
        let output_proxy = single_proxy(region, output_proxies, "output proxy")?;
        let order = Scheduler::new(workflow).region_order(region.id)?;

        Ok(RegionLayout {
            input_proxy,
            output_proxy,
            order,
        })
    }

    /// Execute `region` and return its output value. A failing member
    /// aborts the remaining iterations.
    pub async fn execute(
        &self,
        workflow: &Workflow,
        region: &NodeSpec,
        state: &mut RunState,
        scope: &RunScope,
    ) -> Result<Value, FlowError> {
        let NodeKind::Region { mode, .. } = &region.kind else {
            return Err(WorkflowError::Configuration(format!(
                "node '{}' is not a control-flow region",
                region.name
            ))
            .into());
        };
        let layout = Self::layout(workflow, region)?;
        let input = region_input(state.gather_inputs(workflow, region));
        tracing::info!(
            "Region '{}' starting in {} mode with {} member(s)",
            region.name,
            mode.label(),
            layout.order.len()
        );

        match mode {
            RegionMode::LoopOverCollection => {
                let items = match input {
                    Value::Array(items) => items,
                    Value::Null => Vec::new(),
                    other => vec![other],
                };
                let total = items.len();
                let mut results = Vec::with_capacity(total);
                for (index, item) in items.into_iter().enumerate() {
                    check_cancelled(region, scope)?;
                    let result = self
                        .run_iteration(workflow, &layout, item, state, scope)
                        .await?;
                    results.push(result);
                    emit_progress(region, scope, index + 1, Some(total));
                }
                Ok(Value::Array(results))
            }
            RegionMode::IterateNTimes { max_iterations } => {
                let mut current = input;
                for index in 0..*max_iterations {
                    check_cancelled(region, scope)?;
                    current = self
                        .run_iteration(workflow, &layout, current, state, scope)
                        .await?;
                    emit_progress(region, scope, index + 1, Some(*max_iterations));
                }
                Ok(current)
            }
            RegionMode::FoldWhile {
                condition,
                max_iterations,
            } => {
                let mut current = input;
                for index in 0..*max_iterations {
                    check_cancelled(region, scope)?;
                    current = self
                        .run_iteration(workflow, &layout, current, state, scope)
                        .await?;
                    emit_progress(region, scope, index + 1, None);

                    let locals = loop_locals(&current, index, *max_iterations, mode);
                    if !self
                        .dispatcher
                        .expressions(state)
                        .evaluate_condition(condition, &locals)
                    {
                        tracing::debug!(
                            "Region '{}' condition false after {} iteration(s)",
                            region.name,
                            index + 1
                        );
                        break;
                    }
                }
                Ok(current)
            }
            RegionMode::WhileInput {
                condition,
                max_iterations,
            } => {
                let mut current = input;
                for index in 0..*max_iterations {
                    check_cancelled(region, scope)?;
                    let produced = self
                        .run_iteration(workflow, &layout, current.clone(), state, scope)
                        .await?;
                    emit_progress(region, scope, index + 1, None);

                    let locals = loop_locals(&current, index, *max_iterations, mode);
                    current = produced;
                    if !self
                        .dispatcher
                        .expressions(state)
                        .evaluate_condition(condition, &locals)
                    {
                        tracing::debug!(
                            "Region '{}' input condition false after {} iteration(s)",
                            region.name,
                            index + 1
                        );
                        break;
                    }
                }
                Ok(current)
            }
            RegionMode::Configuring => Err(WorkflowError::Configuration(format!(
                "region '{}' has no iteration mode",
                region.name
            ))
            .into()),
        }
    }

    async fn run_iteration(
        &self,
        workflow: &Workflow,
        layout: &RegionLayout,
        value: Value,
        state: &mut RunState,
        scope: &RunScope,
    ) -> Result<Value, FlowError> {
        state.clear_marks(layout.order.iter());

        let mut proxy_outputs = HashMap::from([(PROXY_PORT.to_string(), value.clone())]);
        for conn in workflow.outgoing(layout.input_proxy) {
            proxy_outputs.insert(conn.from_port.clone(), value.clone());
        }
        state.set_outputs(layout.input_proxy, proxy_outputs);
        state.set_status(layout.input_proxy, NodeStatus::Success);

        for node_id in &layout.order {
            if self
                .dispatcher
                .skip_if_inactive(workflow, *node_id, state, scope)
            {
                continue;
            }
            self.dispatcher
                .execute(workflow, *node_id, state, scope)
                .await?;
        }

        let mut collected: Vec<Value> = workflow
            .incoming(layout.output_proxy)
            .map(|conn| {
                state
                    .output_of(conn.from_node, &conn.from_port)
                    .cloned()
                    .unwrap_or(Value::Null)
            })
            .collect();
        let result = match collected.len() {
            0 => Value::Null,
            1 => collected.remove(0),
            _ => Value::Array(collected),
        };
        state.set_outputs(
            layout.output_proxy,
            HashMap::from([(PROXY_PORT.to_string(), result.clone())]),
        );
        state.set_status(layout.output_proxy, NodeStatus::Success);
        Ok(result)
    }
}

fn single_proxy(
    region: &NodeSpec,
    found: Vec<NodeId>,
    what: &str,
) -> Result<NodeId, WorkflowError> {
    match found.as_slice() {
        [only] => Ok(*only),
        _ => Err(WorkflowError::Configuration(format!(
            "region '{}' needs exactly one {}, found {}",
            region.name,
            what,
            found.len()
        ))),
    }
}

/// The region's `input` port, or its only input when named differently.
fn region_input(mut inputs: HashMap<String, Value>) -> Value {
    if let Some(value) = inputs.remove(REGION_INPUT_PORT) {
        return value;
    }
    if inputs.len() == 1 {
        return inputs.into_values().next().unwrap_or_default();
    }
    Value::Null
}

fn check_cancelled(region: &NodeSpec, scope: &RunScope) -> Result<(), FlowError> {
    if scope.cancellation.is_cancelled() {
        return Err(FlowError::node(region.id, NodeError::Cancelled));
    }
    Ok(())
}

fn emit_progress(region: &NodeSpec, scope: &RunScope, iteration: usize, total: Option<usize>) {
    scope.events.emit(ExecutionEvent::RegionProgress {
        execution_id: scope.execution_id,
        region_id: region.id,
        iteration,
        total,
        timestamp: Utc::now(),
    });
}

fn loop_locals(
    current: &Value,
    index: usize,
    max_iterations: usize,
    mode: &RegionMode,
) -> HashMap<String, Value> {
    HashMap::from([
        ("data".to_string(), current.clone()),
        ("result".to_string(), current.clone()),
        ("current_index".to_string(), Value::from(index)),
        ("current_iteration".to_string(), Value::from(index + 1)),
        ("iteration_count".to_string(), Value::from(index + 1)),
        ("max_iterations".to_string(), Value::from(max_iterations)),
        ("loop_mode".to_string(), Value::from(mode.label())),
    ])
}
