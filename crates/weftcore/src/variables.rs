use crate::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Layered variable store read by the expression engine.
///
/// Three scopes are flattened into one namespace at lookup time:
/// `env_<field>`, `custom_<name>` and `node_<node>_<port>`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariableContext {
    #[serde(default)]
    pub env: ExecutionEnvironment,
    #[serde(default)]
    pub custom: HashMap<String, CustomVariable>,
    #[serde(default)]
    pub node: HashMap<String, NodeVariable>,
}

/// Fields describing the current execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEnvironment {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub canvas_id: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomVariable {
    pub value: Value,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub scope: VariableScope,
    #[serde(default)]
    pub read_only: bool,
}

impl CustomVariable {
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            description: String::new(),
            scope: VariableScope::Global,
            read_only: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableScope {
    #[default]
    Global,
    Canvas,
    Session,
}

/// A value in the node-output scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeVariable {
    pub value: Value,
    #[serde(default)]
    pub policy: UpdatePolicy,
}

/// How a node-output variable reacts when the node produces a new value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePolicy {
    /// Keep the registered value.
    Fixed,
    #[default]
    Replace,
    /// Collect every produced value into an array.
    Append,
}

impl VariableContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a custom variable. Read-only entries are kept and
    /// `false` is returned.
    pub fn set_custom(&mut self, name: impl Into<String>, value: impl Into<Value>) -> bool {
        let name = name.into();
        match self.custom.get_mut(&name) {
            Some(existing) if existing.read_only => false,
            Some(existing) => {
                existing.value = value.into();
                true
            }
            None => {
                self.custom.insert(name, CustomVariable::new(value));
                true
            }
        }
    }

    pub fn define_custom(&mut self, name: impl Into<String>, variable: CustomVariable) {
        self.custom.insert(name.into(), variable);
    }

    /// Register a node-output variable with an explicit policy.
    pub fn register_node_variable(
        &mut self,
        key: impl Into<String>,
        value: impl Into<Value>,
        policy: UpdatePolicy,
    ) {
        self.node.insert(
            key.into(),
            NodeVariable {
                value: value.into(),
                policy,
            },
        );
    }

    /// Name under which `port` of `node_name` appears in the node scope.
    pub fn node_key(node_name: &str, port: &str) -> String {
        format!("{}_{}", sanitize_identifier(node_name), sanitize_identifier(port))
    }

    /// Write a node's outputs into the node-output scope, honouring each
    /// entry's update policy. Returns the keys whose value changed.
    pub fn record_outputs(
        &mut self,
        node_name: &str,
        outputs: &HashMap<String, Value>,
    ) -> Vec<(String, Value)> {
        let mut changed = Vec::new();
        for (port, value) in outputs {
            let key = Self::node_key(node_name, port);
            let entry = self.node.entry(key.clone()).or_insert_with(|| NodeVariable {
                value: Value::Null,
                policy: UpdatePolicy::Replace,
            });
            match entry.policy {
                UpdatePolicy::Fixed => continue,
                UpdatePolicy::Replace => entry.value = value.clone(),
                UpdatePolicy::Append => match &mut entry.value {
                    Value::Array(items) => items.push(value.clone()),
                    Value::Null => entry.value = Value::Array(vec![value.clone()]),
                    other => {
                        let previous = std::mem::take(other);
                        entry.value = Value::Array(vec![previous, value.clone()]);
                    }
                },
            }
            changed.push((key, entry.value.clone()));
        }
        changed
    }

    /// Flatten all scopes into `env_*`, `custom_*` and `node_*` names.
    pub fn flatten(&self) -> HashMap<String, Value> {
        let mut vars = HashMap::new();
        let env = &self.env;
        for (field, value) in [
            ("user_id", &env.user_id),
            ("canvas_id", &env.canvas_id),
            ("session_id", &env.session_id),
            ("run_id", &env.run_id),
        ] {
            vars.insert(format!("env_{}", field), Value::String(value.clone()));
        }
        for (key, value) in &env.metadata {
            vars.insert(format!("env_{}", sanitize_identifier(key)), value.clone());
        }
        for (name, var) in &self.custom {
            vars.insert(format!("custom_{}", sanitize_identifier(name)), var.value.clone());
        }
        for (key, var) in &self.node {
            vars.insert(format!("node_{}", sanitize_identifier(key)), var.value.clone());
        }
        vars
    }
}

/// Replace every character that cannot appear in an identifier with `_`.
pub fn sanitize_identifier(raw: &str) -> String {
    let mut out: String = raw
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if out.is_empty() || out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}
