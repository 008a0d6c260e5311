use std::collections::HashMap;
use std::sync::Arc;
use weftcore::{ComponentRunner, ComponentSpec, WorkflowError};

/// Components known to the engine, keyed by component id
pub struct ComponentRegistry {
    components: HashMap<String, Arc<ComponentSpec>>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self {
            components: HashMap::new(),
        }
    }

    /// Register a component; a later registration with the same id replaces
    /// the earlier one.
    pub fn register(&mut self, spec: ComponentSpec) {
        tracing::info!(
            "Registering component: {} ({}, {})",
            spec.id,
            spec.runtime,
            spec.source_path.display()
        );
        self.components.insert(spec.id.clone(), Arc::new(spec));
    }

    pub fn lookup(&self, component_id: &str) -> Result<Arc<ComponentSpec>, WorkflowError> {
        self.components
            .get(component_id)
            .cloned()
            .ok_or_else(|| WorkflowError::UnknownComponent(component_id.to_string()))
    }

    pub fn contains(&self, component_id: &str) -> bool {
        self.components.contains_key(component_id)
    }

    /// All components, sorted by id.
    pub fn list(&self) -> Vec<Arc<ComponentSpec>> {
        let mut all: Vec<_> = self.components.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Runners keyed by the runtime kind they serve
pub struct RunnerRegistry {
    runners: HashMap<String, Arc<dyn ComponentRunner>>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self {
            runners: HashMap::new(),
        }
    }

    pub fn register(&mut self, runner: Arc<dyn ComponentRunner>) {
        let runtime = runner.runtime().to_string();
        tracing::info!("Registering runner for runtime: {}", runtime);
        self.runners.insert(runtime, runner);
    }

    pub fn get(&self, runtime: &str) -> Result<Arc<dyn ComponentRunner>, WorkflowError> {
        self.runners
            .get(runtime)
            .cloned()
            .ok_or_else(|| WorkflowError::UnknownRuntime(runtime.to_string()))
    }

    pub fn list_runtimes(&self) -> Vec<String> {
        let mut kinds: Vec<_> = self.runners.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

impl Default for RunnerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
