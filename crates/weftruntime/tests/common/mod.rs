// Shared helpers for runtime tests: an in-process runner whose components
// are plain closures.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use weftcore::{
    ComponentRunner, ComponentSpec, NodeContext, NodeError, NodeOutput, Outputs, PortSpec, Value,
};
use weftruntime::{ComponentRegistry, RunnerRegistry, RuntimeConfig, WeftRuntime};

pub const TEST_RUNTIME: &str = "test";

type Handler = Arc<dyn Fn(&NodeContext) -> Result<Outputs, NodeError> + Send + Sync>;

/// Runner that dispatches on component id to a closure and records calls
#[derive(Clone, Default)]
pub struct ScriptedRunner {
    handlers: HashMap<String, Handler>,
    delays: HashMap<String, Duration>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(
        mut self,
        component_id: &str,
        handler: impl Fn(&NodeContext) -> Result<Outputs, NodeError> + Send + Sync + 'static,
    ) -> Self {
        self.handlers
            .insert(component_id.to_string(), Arc::new(handler));
        self
    }

    /// Make `component_id` wait before running, unless cancelled first.
    pub fn slow(mut self, component_id: &str, delay: Duration) -> Self {
        self.delays.insert(component_id.to_string(), delay);
        self
    }

    /// Node names in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn components(&self) -> ComponentRegistry {
        let mut registry = ComponentRegistry::new();
        for id in self.handlers.keys() {
            registry.register(
                ComponentSpec::new(id.clone(), TEST_RUNTIME, format!("{}.test", id))
                    .with_input(PortSpec::new("input").multi()),
            );
        }
        registry
    }

    pub fn into_runtime(self) -> WeftRuntime {
        let components = self.components();
        let mut runners = RunnerRegistry::new();
        runners.register(Arc::new(self));
        WeftRuntime::new(components, runners, RuntimeConfig::default())
    }
}

#[async_trait]
impl ComponentRunner for ScriptedRunner {
    fn runtime(&self) -> &str {
        TEST_RUNTIME
    }

    async fn run(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let name = ctx.stable_key.split("||").nth(1).unwrap_or_default().to_string();
        self.calls.lock().unwrap().push(name);

        if let Some(delay) = self.delays.get(&ctx.component.id) {
            tokio::select! {
                _ = tokio::time::sleep(*delay) => {}
                _ = ctx.cancellation.cancelled() => return Err(NodeError::Cancelled),
            }
        }

        let handler = self
            .handlers
            .get(&ctx.component.id)
            .ok_or_else(|| NodeError::Configuration(ctx.component.id.clone()))?;
        handler(&ctx).map(NodeOutput::from)
    }
}

/// `{"output": input * 2}`
pub fn double(ctx: &NodeContext) -> Result<Outputs, NodeError> {
    let value = ctx.require_input("input")?.as_f64().unwrap_or_default();
    Ok(HashMap::from([("output".to_string(), Value::from(value * 2.0))]))
}

/// `{"output": input + 1}`
pub fn increment(ctx: &NodeContext) -> Result<Outputs, NodeError> {
    let value = ctx.require_input("input")?.as_f64().unwrap_or_default();
    Ok(HashMap::from([("output".to_string(), Value::from(value + 1.0))]))
}

/// Emits the `value` param on `output`.
pub fn constant(ctx: &NodeContext) -> Result<Outputs, NodeError> {
    let value = ctx.params.get("value").cloned().unwrap_or_default();
    Ok(HashMap::from([("output".to_string(), value)]))
}

pub fn fail(_ctx: &NodeContext) -> Result<Outputs, NodeError> {
    Err(NodeError::execution("boom"))
}

pub fn standard_runner() -> ScriptedRunner {
    ScriptedRunner::new()
        .on("double", double)
        .on("increment", increment)
        .on("constant", constant)
        .on("fail", fail)
}
