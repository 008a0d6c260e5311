use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, Reversed};
use petgraph::Direction;
use std::collections::{HashMap, HashSet, VecDeque};
use weftcore::{NodeId, Workflow, WorkflowError};

/// Computes execution order over one nesting level of a workflow.
///
/// The top level holds every node outside a region; a region's level holds
/// its non-proxy members. Edges touching nested nodes are lifted to the node
/// that represents them at the level being ordered.
pub struct Scheduler<'a> {
    workflow: &'a Workflow,
}

/// Dependency graph of one level
struct LevelGraph {
    graph: DiGraph<NodeId, ()>,
    index: HashMap<NodeId, NodeIndex>,
    self_loops: HashSet<NodeId>,
}

impl<'a> Scheduler<'a> {
    pub fn new(workflow: &'a Workflow) -> Self {
        Self { workflow }
    }

    /// Order every top-level node.
    pub fn full_order(&self) -> Result<Vec<NodeId>, WorkflowError> {
        let nodes = self.workflow.top_level_nodes();
        let level = self.level_graph(None, &nodes);
        kahn(&level, &nodes)
    }

    /// Order a region's members, proxies excluded.
    pub fn region_order(&self, region: NodeId) -> Result<Vec<NodeId>, WorkflowError> {
        if self.workflow.region_members(region).is_none() {
            return Err(WorkflowError::Configuration(format!(
                "node {} is not a control-flow region",
                region
            )));
        }
        let nodes = self.workflow.level_nodes(Some(region));
        let level = self.level_graph(Some(region), &nodes);
        kahn(&level, &nodes)
    }

    /// Order an arbitrary subset. All nodes must share one nesting level.
    pub fn order(&self, subset: &[NodeId]) -> Result<Vec<NodeId>, WorkflowError> {
        let Some(first) = subset.first() else {
            return Ok(Vec::new());
        };
        let scope = self.scope_of(*first)?;
        for id in subset {
            if self.scope_of(*id)? != scope {
                return Err(WorkflowError::Invalid(format!(
                    "node {} is not on the same nesting level as {}",
                    id, first
                )));
            }
        }
        let nodes = self.workflow.level_nodes(scope);
        let level = self.level_graph(scope, &nodes);
        kahn(&level, subset)
    }

    /// `node` and everything it transitively depends on, in execution order.
    pub fn ancestors_order(&self, node: NodeId) -> Result<Vec<NodeId>, WorkflowError> {
        self.reachable_order(node, Direction::Incoming)
    }

    /// `node` and everything that transitively depends on it, in execution
    /// order.
    pub fn descendants_order(&self, node: NodeId) -> Result<Vec<NodeId>, WorkflowError> {
        self.reachable_order(node, Direction::Outgoing)
    }

    fn reachable_order(
        &self,
        node: NodeId,
        direction: Direction,
    ) -> Result<Vec<NodeId>, WorkflowError> {
        let scope = self.scope_of(node)?;
        let nodes = self.workflow.level_nodes(scope);
        let level = self.level_graph(scope, &nodes);
        let start = *level
            .index
            .get(&node)
            .ok_or_else(|| WorkflowError::NodeNotFound(node.to_string()))?;

        let mut reached = HashSet::new();
        match direction {
            Direction::Incoming => {
                let reversed = Reversed(&level.graph);
                let mut dfs = Dfs::new(reversed, start);
                while let Some(idx) = dfs.next(reversed) {
                    reached.insert(level.graph[idx]);
                }
            }
            Direction::Outgoing => {
                let mut dfs = Dfs::new(&level.graph, start);
                while let Some(idx) = dfs.next(&level.graph) {
                    reached.insert(level.graph[idx]);
                }
            }
        }

        // keep declaration order so ties break the same way as full_order
        let subset: Vec<NodeId> = nodes.into_iter().filter(|id| reached.contains(id)).collect();
        kahn(&level, &subset)
    }

    fn scope_of(&self, node: NodeId) -> Result<Option<NodeId>, WorkflowError> {
        let spec = self
            .workflow
            .find_node(node)
            .ok_or_else(|| WorkflowError::NodeNotFound(node.to_string()))?;
        if spec.is_proxy() {
            return Err(WorkflowError::Invalid(format!(
                "proxy node {} is not schedulable",
                node
            )));
        }
        Ok(self.workflow.parent_region(node))
    }

    fn level_graph(&self, scope: Option<NodeId>, nodes: &[NodeId]) -> LevelGraph {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        let mut self_loops = HashSet::new();

        for id in nodes {
            index.insert(*id, graph.add_node(*id));
        }

        for conn in &self.workflow.connections {
            let from = self.workflow.representative(conn.from_node, scope);
            let to = self.workflow.representative(conn.to_node, scope);
            let (Some(from), Some(to)) = (from, to) else {
                continue;
            };
            let (Some(&from_idx), Some(&to_idx)) = (index.get(&from), index.get(&to)) else {
                continue;
            };
            if from == to {
                // edges between members of one nested region are that
                // region's business; only a literal self-loop counts here
                if conn.from_node == conn.to_node && conn.from_node == from {
                    self_loops.insert(from);
                }
                continue;
            }
            graph.add_edge(from_idx, to_idx, ());
        }

        LevelGraph {
            graph,
            index,
            self_loops,
        }
    }
}

/// Kahn's algorithm over `subset`, counting only edges with both endpoints
/// in it.
fn kahn(level: &LevelGraph, subset: &[NodeId]) -> Result<Vec<NodeId>, WorkflowError> {
    let mut members = HashSet::new();
    let subset: Vec<NodeId> = subset.iter().copied().filter(|id| members.insert(*id)).collect();
    let mut in_degree: HashMap<NodeId, usize> = HashMap::new();

    for id in &subset {
        let idx = level
            .index
            .get(id)
            .ok_or_else(|| WorkflowError::NodeNotFound(id.to_string()))?;
        let mut degree = level
            .graph
            .neighbors_directed(*idx, Direction::Incoming)
            .filter(|pred| members.contains(&level.graph[*pred]))
            .count();
        if level.self_loops.contains(id) {
            degree += 1;
        }
        in_degree.insert(*id, degree);
    }

    let mut queue: VecDeque<NodeId> = subset
        .iter()
        .filter(|id| in_degree.get(*id) == Some(&0))
        .copied()
        .collect();
    let mut order = Vec::with_capacity(subset.len());

    while let Some(id) = queue.pop_front() {
        order.push(id);
        let idx = level.index[&id];
        for succ in level.graph.neighbors_directed(idx, Direction::Outgoing) {
            let succ_id = level.graph[succ];
            if let Some(degree) = in_degree.get_mut(&succ_id) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(succ_id);
                }
            }
        }
    }

    if order.len() < subset.len() {
        let ordered: HashSet<NodeId> = order.iter().copied().collect();
        let stuck: Vec<NodeId> = subset
            .iter()
            .filter(|id| !ordered.contains(*id))
            .copied()
            .collect();
        tracing::warn!("Cycle detected among {} node(s)", stuck.len());
        return Err(WorkflowError::CyclicDependency { nodes: stuck });
    }

    Ok(order)
}
