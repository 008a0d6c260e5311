use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

#[derive(Error, Debug)]
pub enum InstallError {
    #[error("Could not start installer for {package}: {source}")]
    Spawn {
        package: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Installing {package} failed ({status}): {stderr}")]
    Failed {
        package: String,
        status: String,
        stderr: String,
    },

    #[error("Installing {package} timed out after {millis}ms")]
    Timeout { package: String, millis: u64 },
}

/// Installs one external requirement into an interpreter's environment
#[async_trait]
pub trait PackageInstaller: Send + Sync {
    async fn install(&self, interpreter: &Path, package: &str) -> Result<(), InstallError>;
}

/// `<interpreter> -m pip install <package>`
#[derive(Debug, Clone)]
pub struct PipInstaller {
    timeout: Duration,
}

impl PipInstaller {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl PackageInstaller for PipInstaller {
    async fn install(&self, interpreter: &Path, package: &str) -> Result<(), InstallError> {
        tracing::info!("Installing {} with {}", package, interpreter.display());

        let mut cmd = Command::new(interpreter);
        cmd.args(["-m", "pip", "install", package])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(result) => result.map_err(|source| InstallError::Spawn {
                package: package.to_string(),
                source,
            })?,
            Err(_) => {
                return Err(InstallError::Timeout {
                    package: package.to_string(),
                    millis: self.timeout.as_millis() as u64,
                })
            }
        };

        if !output.status.success() {
            return Err(InstallError::Failed {
                package: package.to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}
