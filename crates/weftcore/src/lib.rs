//! Core abstractions for the weft workflow engine
//!
//! This crate holds the graph model, dynamic values, the layered variable
//! context, component descriptors and the runner contract that every
//! execution backend implements.

mod component;
mod document;
mod error;
pub mod events;
mod node;
mod value;
mod variables;
mod workflow;

pub use component::{ComponentSpec, Multiplicity, ParamKind, ParamSpec, PortSpec};
pub use document::{PersistedNodeState, RuntimeSection, WorkflowDocument};
pub use error::{FlowError, NodeError, WorkflowError};
pub use events::*;
pub use node::{ComponentRunner, NodeContext, NodeMetadata, NodeOutput, Outputs};
pub use value::Value;
pub use variables::{
    sanitize_identifier, CustomVariable, ExecutionEnvironment, NodeVariable, UpdatePolicy,
    VariableContext, VariableScope,
};
pub use workflow::{
    BranchCondition, Connection, NodeId, NodeKind, NodeSpec, NodeStatus, Position, RegionMode,
    Workflow, WorkflowId, WorkflowSettings,
};

pub type Result<T> = std::result::Result<T, FlowError>;
