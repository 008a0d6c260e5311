use crate::{Value, VariableContext};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

pub type WorkflowId = Uuid;
pub type NodeId = Uuid;

/// Complete workflow graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub variables: VariableContext,
    #[serde(default)]
    pub settings: WorkflowSettings,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            nodes: Vec::new(),
            connections: Vec::new(),
            variables: VariableContext::default(),
            settings: WorkflowSettings::default(),
        }
    }

    pub fn add_node(&mut self, node: NodeSpec) -> NodeId {
        let id = node.id;
        self.nodes.push(node);
        id
    }

    pub fn connect(
        &mut self,
        from_node: NodeId,
        from_port: impl Into<String>,
        to_node: NodeId,
        to_port: impl Into<String>,
    ) {
        self.connections.push(Connection {
            from_node,
            from_port: from_port.into(),
            to_node,
            to_port: to_port.into(),
        });
    }

    pub fn find_node(&self, id: NodeId) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn find_node_mut(&mut self, id: NodeId) -> Option<&mut NodeSpec> {
        self.nodes.iter_mut().find(|n| n.id == id)
    }

    /// Look a node up by instance name.
    pub fn find_by_name(&self, name: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Edges entering `node`, in declaration order.
    pub fn incoming(&self, node: NodeId) -> impl Iterator<Item = &Connection> {
        self.connections.iter().filter(move |c| c.to_node == node)
    }

    /// Edges leaving `node`, in declaration order.
    pub fn outgoing(&self, node: NodeId) -> impl Iterator<Item = &Connection> {
        self.connections.iter().filter(move |c| c.from_node == node)
    }

    pub fn upstream_of(&self, node: NodeId) -> Vec<NodeId> {
        let mut ids = Vec::new();
        for conn in self.incoming(node) {
            if !ids.contains(&conn.from_node) {
                ids.push(conn.from_node);
            }
        }
        ids
    }

    /// Members of a region node, or `None` if `region` is not a region.
    pub fn region_members(&self, region: NodeId) -> Option<&[NodeId]> {
        match self.find_node(region).map(|n| &n.kind) {
            Some(NodeKind::Region { members, .. }) => Some(members),
            _ => None,
        }
    }

    /// The region that directly contains `node`.
    pub fn parent_region(&self, node: NodeId) -> Option<NodeId> {
        self.nodes.iter().find_map(|candidate| match &candidate.kind {
            NodeKind::Region { members, .. } if members.contains(&node) => Some(candidate.id),
            _ => None,
        })
    }

    /// Nodes that belong to no region.
    pub fn top_level_nodes(&self) -> Vec<NodeId> {
        self.level_nodes(None)
    }

    /// Schedulable nodes directly inside `scope` (`None` is the top level).
    /// Proxy nodes are never schedulable.
    pub fn level_nodes(&self, scope: Option<NodeId>) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| !n.is_proxy() && self.parent_region(n.id) == scope)
            .map(|n| n.id)
            .collect()
    }

    /// Lift `node` to the node that stands for it at `scope`: itself when it
    /// lives directly in `scope`, otherwise the enclosing region that does.
    /// Returns `None` when `node` is not inside `scope` at all.
    pub fn representative(&self, node: NodeId, scope: Option<NodeId>) -> Option<NodeId> {
        let mut current = node;
        // bounded walk; malformed nesting must not loop forever
        for _ in 0..=self.nodes.len() {
            let parent = self.parent_region(current);
            if parent == scope {
                return Some(current);
            }
            current = parent?;
        }
        None
    }
}

/// Node instance in a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: NodeId,
    pub name: String,
    pub kind: NodeKind,
    #[serde(default)]
    pub params: HashMap<String, Value>,
    /// Preset input values, used for ports with no incoming edge.
    #[serde(default)]
    pub inputs: HashMap<String, Value>,
    /// Outputs of the last successful execution.
    #[serde(default)]
    pub outputs: HashMap<String, Value>,
    #[serde(default)]
    pub status: NodeStatus,
    #[serde(default)]
    pub position: Option<Position>,
}

impl NodeSpec {
    pub fn new(kind: NodeKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: kind.label().to_string(),
            kind,
            params: HashMap::new(),
            inputs: HashMap::new(),
            outputs: HashMap::new(),
            status: NodeStatus::Unrun,
            position: None,
        }
    }

    pub fn component(component_id: impl Into<String>) -> Self {
        let component_id = component_id.into();
        let mut node = Self::new(NodeKind::Component {
            component_id: component_id.clone(),
        });
        node.name = component_id;
        node
    }

    pub fn region(mode: RegionMode, members: Vec<NodeId>) -> Self {
        Self::new(NodeKind::Region { mode, members })
    }

    pub fn input_proxy() -> Self {
        Self::new(NodeKind::InputProxy)
    }

    pub fn output_proxy() -> Self {
        Self::new(NodeKind::OutputProxy)
    }

    pub fn branch(conditions: Vec<BranchCondition>, enable_else: bool) -> Self {
        Self::new(NodeKind::Branch {
            conditions,
            enable_else,
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_input(mut self, port: impl Into<String>, value: impl Into<Value>) -> Self {
        self.inputs.insert(port.into(), value.into());
        self
    }

    pub fn with_position(mut self, x: f32, y: f32) -> Self {
        self.position = Some(Position { x, y });
        self
    }

    /// `component_id||instance_name`, stable across save/load cycles.
    pub fn stable_key(&self) -> String {
        let prefix = match &self.kind {
            NodeKind::Component { component_id } => component_id.as_str(),
            other => other.label(),
        };
        format!("{}||{}", prefix, self.name)
    }

    pub fn component_id(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Component { component_id } => Some(component_id),
            _ => None,
        }
    }

    pub fn is_proxy(&self) -> bool {
        matches!(self.kind, NodeKind::InputProxy | NodeKind::OutputProxy)
    }
}

/// What a node does when executed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeKind {
    /// Component run through a registered runner.
    Component { component_id: String },
    /// Control-flow region executing its members once per iteration.
    Region {
        #[serde(default)]
        mode: RegionMode,
        #[serde(default)]
        members: Vec<NodeId>,
    },
    InputProxy,
    OutputProxy,
    /// In-process conditional routing.
    Branch {
        #[serde(default)]
        conditions: Vec<BranchCondition>,
        #[serde(default = "default_true")]
        enable_else: bool,
    },
}

fn default_true() -> bool {
    true
}

impl NodeKind {
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Component { .. } => "component",
            NodeKind::Region { .. } => "region",
            NodeKind::InputProxy => "input_proxy",
            NodeKind::OutputProxy => "output_proxy",
            NodeKind::Branch { .. } => "branch",
        }
    }
}

/// Iteration mode of a control-flow region
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegionMode {
    /// Not yet configured; cannot execute.
    #[default]
    Configuring,
    /// Map the body over every element of the input sequence.
    LoopOverCollection,
    /// Fold the body over the input value `max_iterations` times.
    IterateNTimes { max_iterations: usize },
    /// Fold while `condition` holds after each iteration, bounded by
    /// `max_iterations`.
    FoldWhile {
        condition: String,
        max_iterations: usize,
    },
    /// Like `FoldWhile`, but `condition` sees the value the iteration
    /// started from rather than the one it produced.
    WhileInput {
        condition: String,
        max_iterations: usize,
    },
}

impl RegionMode {
    pub fn label(&self) -> &'static str {
        match self {
            RegionMode::Configuring => "configuring",
            RegionMode::LoopOverCollection => "loop_over_collection",
            RegionMode::IterateNTimes { .. } => "iterate_n_times",
            RegionMode::FoldWhile { .. } => "fold_while",
            RegionMode::WhileInput { .. } => "while_input",
        }
    }

    /// Condition of the condition-driven modes.
    pub fn condition(&self) -> Option<&str> {
        match self {
            RegionMode::FoldWhile { condition, .. } | RegionMode::WhileInput { condition, .. } => {
                Some(condition)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchCondition {
    /// Output port activated when the condition holds.
    pub name: String,
    pub expression: String,
}

impl BranchCondition {
    pub fn new(name: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            expression: expression.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    Unrun,
    Pending,
    Running,
    Success,
    Failed,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            NodeStatus::Unrun => "unrun",
            NodeStatus::Pending => "pending",
            NodeStatus::Running => "running",
            NodeStatus::Success => "success",
            NodeStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Connection between nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub from_node: NodeId,
    pub from_port: String,
    pub to_node: NodeId,
    pub to_port: String,
}

/// Node position in visual editor
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

/// Global workflow settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowSettings {
    /// Per-node timeout override.
    #[serde(default)]
    pub node_timeout_ms: Option<u64>,
}
