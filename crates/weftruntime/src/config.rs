use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use weftcore::FlowError;

/// Configuration for the runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub event_buffer_size: usize,
    /// Per-node timeout unless the workflow overrides it.
    pub node_timeout_ms: u64,
    /// Wall-clock budget for one expression evaluation.
    pub expression_budget_ms: u64,
    /// Root under which every node run gets its own directory.
    pub work_dir: PathBuf,
    /// How long a terminated child may take to exit.
    pub grace_period_ms: u64,
    pub log_poll_interval_ms: u64,
    pub install_timeout_ms: u64,
    pub retain_run_files: bool,
    pub service_port_start: u16,
    pub service_port_end: u16,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            event_buffer_size: 1000,
            node_timeout_ms: 300_000,
            expression_budget_ms: 2_000,
            work_dir: PathBuf::from("temp_runs"),
            grace_period_ms: 5_000,
            log_poll_interval_ms: 100,
            install_timeout_ms: 300_000,
            retain_run_files: true,
            service_port_start: 8000,
            service_port_end: 9000,
        }
    }
}

impl RuntimeConfig {
    /// Read a JSON config file; missing fields keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, FlowError> {
        let bytes = std::fs::read(path.as_ref())?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Apply `WEFT_*` environment overrides.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(dir) = std::env::var("WEFT_WORK_DIR") {
            self.work_dir = PathBuf::from(dir);
        }
        override_u64("WEFT_NODE_TIMEOUT_MS", &mut self.node_timeout_ms);
        override_u64("WEFT_EXPRESSION_BUDGET_MS", &mut self.expression_budget_ms);
        override_u64("WEFT_GRACE_PERIOD_MS", &mut self.grace_period_ms);
        self
    }

    pub fn node_timeout(&self) -> Duration {
        Duration::from_millis(self.node_timeout_ms)
    }

    pub fn expression_budget(&self) -> Duration {
        Duration::from_millis(self.expression_budget_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn log_poll_interval(&self) -> Duration {
        Duration::from_millis(self.log_poll_interval_ms.max(1))
    }

    pub fn install_timeout(&self) -> Duration {
        Duration::from_millis(self.install_timeout_ms)
    }
}

fn override_u64(var: &str, target: &mut u64) {
    match std::env::var(var).map(|raw| raw.parse::<u64>()) {
        Ok(Ok(value)) => *target = value,
        Ok(Err(e)) => tracing::warn!("Ignoring {}: {}", var, e),
        Err(_) => {}
    }
}
