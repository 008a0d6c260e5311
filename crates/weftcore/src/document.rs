use crate::{NodeStatus, Result, Value, Workflow};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// On-disk workflow: the graph plus run-time metadata keyed by stable key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDocument {
    pub graph: Workflow,
    #[serde(default)]
    pub runtime: RuntimeSection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeSection {
    #[serde(default)]
    pub interpreter_path: Option<PathBuf>,
    /// `component_id||instance_name` -> last known state
    #[serde(default)]
    pub nodes: HashMap<String, PersistedNodeState>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedNodeState {
    #[serde(default)]
    pub status: NodeStatus,
    #[serde(default)]
    pub inputs: HashMap<String, Value>,
    #[serde(default)]
    pub outputs: HashMap<String, Value>,
}

impl WorkflowDocument {
    pub fn new(graph: Workflow) -> Self {
        Self {
            graph,
            runtime: RuntimeSection::default(),
        }
    }

    pub fn with_interpreter(mut self, path: impl Into<PathBuf>) -> Self {
        self.runtime.interpreter_path = Some(path.into());
        self
    }

    /// Read a document and apply its run-time section to the graph.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        let mut doc: WorkflowDocument = serde_json::from_slice(&bytes)?;
        doc.restore();
        debug!(
            path = %path.as_ref().display(),
            nodes = doc.graph.nodes.len(),
            "Loaded workflow document"
        );
        Ok(doc)
    }

    /// Capture the graph's current state and write the document.
    pub fn save(&mut self, path: impl AsRef<Path>) -> Result<()> {
        self.capture();
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(path.as_ref(), json)?;
        Ok(())
    }

    /// Copy persisted status and last I/O onto graph nodes by stable key.
    pub fn restore(&mut self) {
        for node in &mut self.graph.nodes {
            let Some(state) = self.runtime.nodes.get(&node.stable_key()) else {
                continue;
            };
            // a run interrupted mid-flight is not resumable
            node.status = match state.status {
                NodeStatus::Running | NodeStatus::Pending => NodeStatus::Unrun,
                other => other,
            };
            node.outputs = state.outputs.clone();
            for (port, value) in &state.inputs {
                node.inputs.entry(port.clone()).or_insert_with(|| value.clone());
            }
        }
    }

    /// Record every node's status and last I/O under its stable key.
    pub fn capture(&mut self) {
        let mut nodes = HashMap::new();
        for node in &self.graph.nodes {
            let key = node.stable_key();
            if nodes.contains_key(&key) {
                warn!(key = %key, "Duplicate stable key; later node wins");
            }
            nodes.insert(
                key,
                PersistedNodeState {
                    status: node.status,
                    inputs: node.inputs.clone(),
                    outputs: node.outputs.clone(),
                },
            );
        }
        self.runtime.nodes = nodes;
    }
}
