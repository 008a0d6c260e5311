use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;
use weftcore::{sanitize_identifier, NodeError, Outputs, Value};

pub const TRANSFER_FILE: &str = "transfer.json";
pub const RESULT_FILE: &str = "result.json";
pub const ERROR_FILE: &str = "error.json";
pub const LOG_FILE: &str = "node.log";

/// Error type the entry script reports when the component cannot import
/// one of its dependencies.
pub const MISSING_DEPENDENCY: &str = "missing_dependency";

/// `[params, inputs, variables]` as written to the transfer file
#[derive(Debug, Serialize)]
pub struct TransferPayload<'a>(
    pub &'a HashMap<String, Value>,
    pub &'a HashMap<String, Value>,
    pub &'a HashMap<String, Value>,
);

/// Structured error written by the child process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildError {
    pub error_message: String,
    #[serde(default)]
    pub traceback_text: String,
    #[serde(default)]
    pub error_type: String,
}

impl ChildError {
    pub fn is_missing_dependency(&self) -> bool {
        self.error_type == MISSING_DEPENDENCY
    }
}

impl From<ChildError> for NodeError {
    fn from(err: ChildError) -> Self {
        NodeError::Execution {
            message: err.error_message,
            traceback: err.traceback_text,
            error_type: err.error_type,
        }
    }
}

/// How one attempt ended, when it did not succeed
#[derive(Debug)]
pub enum ChildFailure {
    /// Recoverable by installing the component's requirements.
    MissingDependency(ChildError),
    Fatal(NodeError),
}

impl From<ChildFailure> for NodeError {
    fn from(failure: ChildFailure) -> Self {
        match failure {
            ChildFailure::MissingDependency(err) => err.into(),
            ChildFailure::Fatal(err) => err,
        }
    }
}

impl From<io::Error> for ChildFailure {
    fn from(err: io::Error) -> Self {
        ChildFailure::Fatal(err.into())
    }
}

/// Private directory of one node run. No other run reads or writes it.
#[derive(Debug, Clone)]
pub struct RunFiles {
    dir: PathBuf,
    script: PathBuf,
    node_key: String,
}

impl RunFiles {
    /// Create `run_<key>_<timestamp>_<suffix>` under `work_dir`.
    pub async fn create(work_dir: &Path, stable_key: &str, script_name: &str) -> io::Result<Self> {
        tokio::fs::create_dir_all(work_dir).await?;
        let name = format!(
            "run_{}_{}_{}",
            sanitize_identifier(stable_key),
            Utc::now().format("%Y%m%dT%H%M%S%6f"),
            &Uuid::new_v4().simple().to_string()[..8]
        );
        let dir = work_dir.join(name);
        // create_dir, not create_dir_all: an existing directory is an error
        tokio::fs::create_dir(&dir).await?;
        let dir = tokio::fs::canonicalize(&dir).await?;
        Ok(Self {
            script: dir.join(script_name),
            dir,
            node_key: stable_key.to_string(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn node_key(&self) -> &str {
        &self.node_key
    }

    pub fn script(&self) -> &Path {
        &self.script
    }

    pub fn transfer(&self) -> PathBuf {
        self.dir.join(TRANSFER_FILE)
    }

    pub fn result(&self) -> PathBuf {
        self.dir.join(RESULT_FILE)
    }

    pub fn error(&self) -> PathBuf {
        self.dir.join(ERROR_FILE)
    }

    pub fn log(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    pub async fn write_transfer(&self, payload: &TransferPayload<'_>) -> Result<(), NodeError> {
        let bytes = serde_json::to_vec(payload)
            .map_err(|e| NodeError::Io(format!("cannot serialize transfer payload: {}", e)))?;
        tokio::fs::write(self.transfer(), bytes).await?;
        Ok(())
    }

    pub async fn write_script(&self, content: &str) -> io::Result<()> {
        tokio::fs::write(&self.script, content).await
    }

    /// Remove result and error files left by a previous attempt.
    pub async fn clear_outcome(&self) -> io::Result<()> {
        for path in [self.result(), self.error()] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// `None` when the child wrote no result file.
    pub async fn read_result(&self) -> Option<Result<Outputs, String>> {
        let bytes = tokio::fs::read(self.result()).await.ok()?;
        Some(
            serde_json::from_slice::<Outputs>(&bytes)
                .map_err(|e| format!("malformed result file: {}", e)),
        )
    }

    /// `None` when the child wrote no error file.
    pub async fn read_error(&self) -> Option<Result<ChildError, String>> {
        let bytes = tokio::fs::read(self.error()).await.ok()?;
        Some(
            serde_json::from_slice::<ChildError>(&bytes)
                .map_err(|e| format!("malformed error file: {}", e)),
        )
    }

    pub async fn remove(&self) {
        if let Err(e) = tokio::fs::remove_dir_all(&self.dir).await {
            tracing::warn!("Could not remove run directory {}: {}", self.dir.display(), e);
        }
    }
}
