//! Workflow execution runtime
//!
//! This crate orders node execution, resolves dynamic parameters, drives
//! control-flow regions and coordinates batches without blocking the caller.
//! Component processes themselves are launched by runners registered from
//! outside (see `weftnodes`).

mod config;
mod coordinator;
mod dispatch;
pub mod expression;
mod loader;
mod ports;
mod region;
mod registry;
mod runtime;
mod scheduler;
mod state;
mod validation;

pub use config::RuntimeConfig;
pub use coordinator::{BatchOutcome, BatchReport, RunCoordinator, RunHandle, RunRequest};
pub use dispatch::{NodeDispatcher, RunScope};
pub use expression::ExpressionEngine;
pub use loader::ComponentLoader;
pub use ports::{PortAllocator, PortError, PortLease};
pub use region::RegionExecutor;
pub use registry::{ComponentRegistry, RunnerRegistry};
pub use runtime::{RunTarget, WeftRuntime};
pub use scheduler::Scheduler;
pub use state::RunState;
pub use validation::{validate_batch, validate_workflow};
