use crate::region::RegionExecutor;
use crate::{ComponentRegistry, RunnerRegistry};
use std::collections::{HashMap, HashSet};
use weftcore::{Multiplicity, NodeId, NodeKind, RegionMode, Workflow, WorkflowError};

/// Structural checks that hold for any workflow, independent of what runs.
pub fn validate_workflow(
    workflow: &Workflow,
    components: &ComponentRegistry,
) -> Result<(), WorkflowError> {
    let mut ids = HashSet::new();
    for node in &workflow.nodes {
        if !ids.insert(node.id) {
            return Err(WorkflowError::Invalid(format!("duplicate node id {}", node.id)));
        }
    }

    let mut fan_in: HashMap<(NodeId, &str), usize> = HashMap::new();
    for conn in &workflow.connections {
        for endpoint in [conn.from_node, conn.to_node] {
            if !ids.contains(&endpoint) {
                return Err(WorkflowError::InvalidConnection(format!(
                    "{}.{} -> {}.{} references unknown node {}",
                    conn.from_node, conn.from_port, conn.to_node, conn.to_port, endpoint
                )));
            }
        }
        *fan_in.entry((conn.to_node, conn.to_port.as_str())).or_default() += 1;
    }

    for ((node_id, port), count) in fan_in {
        if count < 2 {
            continue;
        }
        let Some(component_id) = workflow.find_node(node_id).and_then(|n| n.component_id())
        else {
            continue;
        };
        let Ok(spec) = components.lookup(component_id) else {
            continue;
        };
        if let Some(declared) = spec.input_port(port) {
            if declared.multiplicity == Multiplicity::Single {
                return Err(WorkflowError::InvalidConnection(format!(
                    "input '{}' of node {} accepts one connection, found {}",
                    port, node_id, count
                )));
            }
        }
    }

    let mut owner: HashMap<NodeId, NodeId> = HashMap::new();
    for region in &workflow.nodes {
        let NodeKind::Region { members, .. } = &region.kind else {
            continue;
        };
        for member in members {
            if *member == region.id {
                return Err(WorkflowError::Configuration(format!(
                    "region '{}' lists itself as a member",
                    region.name
                )));
            }
            if !ids.contains(member) {
                return Err(WorkflowError::NodeNotFound(member.to_string()));
            }
            if let Some(previous) = owner.insert(*member, region.id) {
                if previous != region.id {
                    return Err(WorkflowError::Configuration(format!(
                        "node {} belongs to more than one region",
                        member
                    )));
                }
            }
        }
    }

    // region nesting must be a tree
    for start in owner.keys() {
        let mut seen = HashSet::new();
        let mut current = *start;
        while let Some(parent) = owner.get(&current) {
            if !seen.insert(*parent) {
                return Err(WorkflowError::Configuration(format!(
                    "region nesting around node {} is circular",
                    start
                )));
            }
            current = *parent;
        }
    }

    Ok(())
}

/// Checks for the nodes of one batch, including region interiors: every
/// component is known and has a runner, every region is well formed and
/// acyclic. Nothing runs if this fails.
pub fn validate_batch(
    workflow: &Workflow,
    order: &[NodeId],
    components: &ComponentRegistry,
    runners: &RunnerRegistry,
) -> Result<(), WorkflowError> {
    for id in order {
        validate_node(workflow, *id, components, runners, 0)?;
    }
    Ok(())
}

fn validate_node(
    workflow: &Workflow,
    id: NodeId,
    components: &ComponentRegistry,
    runners: &RunnerRegistry,
    depth: usize,
) -> Result<(), WorkflowError> {
    if depth > workflow.nodes.len() {
        return Err(WorkflowError::Configuration(
            "regions are nested circularly".to_string(),
        ));
    }
    let node = workflow
        .find_node(id)
        .ok_or_else(|| WorkflowError::NodeNotFound(id.to_string()))?;

    match &node.kind {
        NodeKind::Component { component_id } => {
            let spec = components.lookup(component_id)?;
            runners.get(&spec.runtime)?;
        }
        NodeKind::Region { mode, .. } => {
            match mode {
                RegionMode::Configuring => {
                    return Err(WorkflowError::Configuration(format!(
                        "region '{}' has no iteration mode",
                        node.name
                    )));
                }
                _ if mode.condition().is_some_and(|c| c.trim().is_empty()) => {
                    return Err(WorkflowError::Configuration(format!(
                        "region '{}' has an empty loop condition",
                        node.name
                    )));
                }
                _ => {}
            }
            let layout = RegionExecutor::layout(workflow, node)?;
            for member in layout.order {
                validate_node(workflow, member, components, runners, depth + 1)?;
            }
        }
        NodeKind::Branch { .. } => {}
        NodeKind::InputProxy | NodeKind::OutputProxy => {
            return Err(WorkflowError::Configuration(format!(
                "proxy node '{}' is outside any region",
                node.name
            )));
        }
    }
    Ok(())
}
