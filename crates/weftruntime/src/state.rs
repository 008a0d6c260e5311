use std::collections::{HashMap, HashSet};
use weftcore::{NodeId, NodeSpec, NodeStatus, Outputs, Value, VariableContext, Workflow};

/// Mutable state of one batch: outputs, statuses and variables.
///
/// Owned by the coordinator task and handed down by `&mut`, so node-output
/// writes are serialized.
#[derive(Debug, Clone, Default)]
pub struct RunState {
    pub outputs: HashMap<NodeId, Outputs>,
    pub statuses: HashMap<NodeId, NodeStatus>,
    pub variables: VariableContext,
    disabled: HashSet<NodeId>,
    skipped: HashSet<NodeId>,
}

impl RunState {
    /// Seed from the graph: last outputs of every node and the workflow's
    /// variables.
    pub fn from_workflow(workflow: &Workflow) -> Self {
        Self {
            outputs: workflow
                .nodes
                .iter()
                .filter(|n| !n.outputs.is_empty())
                .map(|n| (n.id, n.outputs.clone()))
                .collect(),
            statuses: workflow.nodes.iter().map(|n| (n.id, n.status)).collect(),
            variables: workflow.variables.clone(),
            disabled: HashSet::new(),
            skipped: HashSet::new(),
        }
    }

    pub fn status(&self, node: NodeId) -> NodeStatus {
        self.statuses.get(&node).copied().unwrap_or_default()
    }

    pub fn set_status(&mut self, node: NodeId, status: NodeStatus) {
        self.statuses.insert(node, status);
    }

    pub fn output_of(&self, node: NodeId, port: &str) -> Option<&Value> {
        self.outputs.get(&node).and_then(|outputs| outputs.get(port))
    }

    pub fn set_outputs(&mut self, node: NodeId, outputs: Outputs) {
        self.outputs.insert(node, outputs);
    }

    /// Inputs for `node`: preset values overridden by connected ports. One
    /// edge yields its value; several edges yield an array in edge order.
    pub fn gather_inputs(&self, workflow: &Workflow, node: &NodeSpec) -> HashMap<String, Value> {
        let mut inputs = node.inputs.clone();
        let mut grouped: Vec<(String, Vec<Value>)> = Vec::new();

        for conn in workflow.incoming(node.id) {
            let value = self
                .output_of(conn.from_node, &conn.from_port)
                .cloned()
                .unwrap_or(Value::Null);
            match grouped.iter_mut().find(|(port, _)| *port == conn.to_port) {
                Some((_, values)) => values.push(value),
                None => grouped.push((conn.to_port.clone(), vec![value])),
            }
        }

        for (port, mut values) in grouped {
            let value = if values.len() == 1 {
                values.remove(0)
            } else {
                Value::Array(values)
            };
            inputs.insert(port, value);
        }
        inputs
    }

    pub fn disable(&mut self, node: NodeId) {
        self.disabled.insert(node);
    }

    /// Skipped nodes drop outputs from earlier runs so nothing downstream
    /// reads stale values.
    pub fn mark_skipped(&mut self, node: NodeId) {
        self.skipped.insert(node);
        self.outputs.remove(&node);
        self.statuses.insert(node, NodeStatus::Unrun);
    }

    pub fn is_skipped(&self, node: NodeId) -> bool {
        self.skipped.contains(&node)
    }

    /// A node is skipped when a branch disabled it, or when every node
    /// feeding it was skipped.
    pub fn should_skip(&self, workflow: &Workflow, node: NodeId) -> bool {
        if self.disabled.contains(&node) {
            return true;
        }
        let upstream = workflow.upstream_of(node);
        !upstream.is_empty() && upstream.iter().all(|id| self.skipped.contains(id))
    }

    /// Forget skip marks for `nodes`, e.g. before a region iteration.
    pub fn clear_marks<'a>(&mut self, nodes: impl IntoIterator<Item = &'a NodeId>) {
        for id in nodes {
            self.disabled.remove(id);
            self.skipped.remove(id);
        }
    }

    /// Write statuses, outputs and variables back into the graph.
    pub fn apply_to(&self, workflow: &mut Workflow) {
        for node in &mut workflow.nodes {
            if let Some(status) = self.statuses.get(&node.id) {
                node.status = *status;
            }
            if let Some(outputs) = self.outputs.get(&node.id) {
                node.outputs = outputs.clone();
            }
        }
        workflow.variables = self.variables.clone();
    }
}
