//! Component runners
//!
//! Production backends that run component logic outside the engine process.

pub mod isolation;

pub use isolation::{
    IsolationConfig, IsolationExecutor, PackageInstaller, PipInstaller, PythonTemplate,
    ScriptTemplate, ShellTemplate,
};
use weftruntime::{RunnerRegistry, RuntimeConfig};

use std::sync::Arc;

/// Register the `python` and `shell` runners with a registry
pub fn register_all(registry: &mut RunnerRegistry, config: &RuntimeConfig) {
    let isolation = IsolationConfig::from_runtime(config);
    registry.register(Arc::new(IsolationExecutor::python(isolation.clone())));
    registry.register(Arc::new(IsolationExecutor::shell(isolation)));
}
