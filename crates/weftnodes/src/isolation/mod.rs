//! Process-isolated component execution

mod executor;
mod files;
mod installer;
mod script;

pub use executor::{IsolationConfig, IsolationExecutor};
pub use files::{ChildError, ChildFailure, RunFiles, TransferPayload, MISSING_DEPENDENCY};
pub use installer::{InstallError, PackageInstaller, PipInstaller};
pub use script::{PythonTemplate, ScriptTemplate, ShellTemplate};
