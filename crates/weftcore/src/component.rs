use crate::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Everything the engine knows about a component before running it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentSpec {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub description: String,
    /// Runner kind, e.g. "python" or "shell".
    pub runtime: String,
    pub source_path: PathBuf,
    /// Class or function implementing the run contract.
    #[serde(default)]
    pub entry: Option<String>,
    #[serde(default)]
    pub inputs: Vec<PortSpec>,
    #[serde(default)]
    pub outputs: Vec<PortSpec>,
    #[serde(default)]
    pub params: HashMap<String, ParamSpec>,
    #[serde(default)]
    pub requirements: Vec<String>,
}

impl ComponentSpec {
    pub fn new(
        id: impl Into<String>,
        runtime: impl Into<String>,
        source_path: impl Into<PathBuf>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            category: String::new(),
            description: String::new(),
            runtime: runtime.into(),
            source_path: source_path.into(),
            entry: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            params: HashMap::new(),
            requirements: Vec::new(),
        }
    }

    pub fn with_input(mut self, port: PortSpec) -> Self {
        self.inputs.push(port);
        self
    }

    pub fn with_output(mut self, port: PortSpec) -> Self {
        self.outputs.push(port);
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, param: ParamSpec) -> Self {
        self.params.insert(name.into(), param);
        self
    }

    pub fn with_requirement(mut self, requirement: impl Into<String>) -> Self {
        self.requirements.push(requirement.into());
        self
    }

    pub fn input_port(&self, name: &str) -> Option<&PortSpec> {
        self.inputs.iter().find(|p| p.name == name)
    }

    /// Default value of every declared parameter.
    pub fn param_defaults(&self) -> HashMap<String, Value> {
        self.params
            .iter()
            .map(|(name, spec)| (name.clone(), spec.default.clone()))
            .collect()
    }

    /// Requirement entries may hold comma-separated package lists.
    pub fn requirement_list(&self) -> Vec<String> {
        self.requirements
            .iter()
            .flat_map(|entry| entry.split(','))
            .map(str::trim)
            .filter(|pkg| !pkg.is_empty())
            .map(String::from)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortSpec {
    pub name: String,
    #[serde(default = "default_port_type")]
    pub port_type: String,
    #[serde(default)]
    pub multiplicity: Multiplicity,
    #[serde(default)]
    pub required: bool,
}

fn default_port_type() -> String {
    "any".to_string()
}

impl PortSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            port_type: default_port_type(),
            multiplicity: Multiplicity::Single,
            required: false,
        }
    }

    pub fn typed(mut self, port_type: impl Into<String>) -> Self {
        self.port_type = port_type.into();
        self
    }

    pub fn multi(mut self) -> Self {
        self.multiplicity = Multiplicity::Multi;
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Multiplicity {
    #[default]
    Single,
    Multi,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    #[serde(default)]
    pub kind: ParamKind,
    #[serde(default)]
    pub default: Value,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub choices: Vec<Value>,
}

impl ParamSpec {
    pub fn new(kind: ParamKind, default: impl Into<Value>) -> Self {
        Self {
            kind,
            default: default.into(),
            label: String::new(),
            choices: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    #[default]
    Text,
    Int,
    Float,
    Bool,
    Choice,
    Json,
}
