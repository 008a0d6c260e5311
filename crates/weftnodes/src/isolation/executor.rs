use super::files::{ChildFailure, RunFiles, TransferPayload};
use super::installer::{PackageInstaller, PipInstaller};
use super::script::{PythonTemplate, ScriptTemplate, ShellTemplate};
use async_trait::async_trait;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::process::Child;
use weftcore::{ComponentRunner, NodeContext, NodeError, NodeMetadata, NodeOutput, Outputs};
use weftruntime::RuntimeConfig;

/// Settings for process-isolated runs
#[derive(Debug, Clone)]
pub struct IsolationConfig {
    pub work_dir: PathBuf,
    /// How long a killed child may take to be reaped.
    pub grace_period: Duration,
    pub log_poll_interval: Duration,
    pub install_timeout: Duration,
    pub retain_run_files: bool,
}

impl IsolationConfig {
    pub fn from_runtime(config: &RuntimeConfig) -> Self {
        Self {
            work_dir: config.work_dir.clone(),
            grace_period: config.grace_period(),
            log_poll_interval: config.log_poll_interval(),
            install_timeout: config.install_timeout(),
            retain_run_files: config.retain_run_files,
        }
    }
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self::from_runtime(&RuntimeConfig::default())
    }
}

/// Runs one component invocation in a child process.
///
/// Every run gets a private directory holding the transfer, result, error
/// and log files. A run failing with a missing dependency gets its
/// requirements installed and is retried exactly once.
pub struct IsolationExecutor {
    template: Arc<dyn ScriptTemplate>,
    installer: Arc<dyn PackageInstaller>,
    config: IsolationConfig,
}

impl IsolationExecutor {
    pub fn new(
        template: Arc<dyn ScriptTemplate>,
        installer: Arc<dyn PackageInstaller>,
        config: IsolationConfig,
    ) -> Self {
        Self {
            template,
            installer,
            config,
        }
    }

    pub fn python(config: IsolationConfig) -> Self {
        let installer = Arc::new(PipInstaller::new(config.install_timeout));
        Self::new(Arc::new(PythonTemplate), installer, config)
    }

    pub fn shell(config: IsolationConfig) -> Self {
        let installer = Arc::new(PipInstaller::new(config.install_timeout));
        Self::new(Arc::new(ShellTemplate::default()), installer, config)
    }

    pub fn config(&self) -> &IsolationConfig {
        &self.config
    }

    /// Run the component described by `ctx` and return its outputs.
    pub async fn execute(&self, ctx: &NodeContext) -> Result<NodeOutput, NodeError> {
        let started = Instant::now();
        let files = RunFiles::create(
            &self.config.work_dir,
            &ctx.stable_key,
            self.template.script_name(),
        )
        .await?;
        tracing::debug!("Node {} runs in {}", ctx.node_id, files.dir().display());

        let result = self.run_with_retry(ctx, &files).await;

        if !self.config.retain_run_files {
            files.remove().await;
        }

        let (outputs, attempts) = result?;
        Ok(NodeOutput {
            outputs,
            metadata: NodeMetadata {
                execution_time_ms: started.elapsed().as_millis() as u64,
                attempts,
                run_dir: self.config.retain_run_files.then(|| files.dir().to_path_buf()),
            },
        })
    }

    async fn run_with_retry(
        &self,
        ctx: &NodeContext,
        files: &RunFiles,
    ) -> Result<(Outputs, u32), NodeError> {
        let payload = TransferPayload(&ctx.params, &ctx.inputs, &ctx.variables);
        files.write_transfer(&payload).await?;

        let source = tokio::fs::canonicalize(&ctx.component.source_path)
            .await
            .unwrap_or_else(|_| ctx.component.source_path.clone());
        let script = self.template.render(&ctx.component, &source, files);
        files.write_script(&script).await?;

        match self.attempt(ctx, files).await {
            Ok(outputs) => Ok((outputs, 1)),
            Err(ChildFailure::MissingDependency(err)) => {
                tracing::warn!(
                    "Node {} is missing a dependency: {}",
                    ctx.node_id,
                    err.error_message
                );
                ctx.events.warn(format!(
                    "Missing dependency ({}); installing requirements",
                    err.error_message
                ));
                self.install_requirements(ctx).await;

                self.attempt(ctx, files)
                    .await
                    .map(|outputs| (outputs, 2))
                    .map_err(NodeError::from)
            }
            Err(ChildFailure::Fatal(err)) => Err(err),
        }
    }

    async fn install_requirements(&self, ctx: &NodeContext) {
        let packages = ctx.component.requirement_list();
        if packages.is_empty() {
            ctx.events
                .warn("Component declares no requirements; retrying as is");
            return;
        }
        for package in packages {
            ctx.events.info(format!("Installing {}", package));
            if let Err(e) = self.installer.install(&ctx.interpreter, &package).await {
                // not fatal; the retry decides
                tracing::warn!("{}", e);
                ctx.events.warn(e.to_string());
            }
        }
    }

    /// Launch the entry script once and wait for exit, deadline or
    /// cancellation, streaming the log meanwhile.
    async fn attempt(&self, ctx: &NodeContext, files: &RunFiles) -> Result<Outputs, ChildFailure> {
        files.clear_outcome().await?;

        let mut cmd = self.template.command(&ctx.interpreter, files.script());
        cmd.current_dir(files.dir())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        // own process group, so terminate reaches whatever the component forks
        #[cfg(unix)]
        cmd.process_group(0);
        let mut child = cmd.spawn().map_err(|e| {
            ChildFailure::Fatal(NodeError::Io(format!(
                "failed to launch {}: {}",
                self.template.runtime(),
                e
            )))
        })?;

        let mut tail = LogTail::new(files.log());
        let deadline = tokio::time::sleep(ctx.timeout);
        tokio::pin!(deadline);
        let mut tick = tokio::time::interval(self.config.log_poll_interval);

        let status = loop {
            let wake = tokio::select! {
                status = child.wait() => Wake::Exited(status),
                _ = &mut deadline => Wake::Deadline,
                _ = ctx.cancellation.cancelled() => Wake::Cancelled,
                _ = tick.tick() => Wake::Tick,
            };
            match wake {
                Wake::Tick => tail.forward(ctx, false).await,
                Wake::Exited(status) => break status?,
                Wake::Deadline => {
                    ctx.events.warn(format!(
                        "Timed out after {}ms; terminating",
                        ctx.timeout.as_millis()
                    ));
                    self.terminate(&mut child).await;
                    tail.forward(ctx, true).await;
                    return Err(ChildFailure::Fatal(NodeError::Timeout {
                        millis: ctx.timeout.as_millis() as u64,
                    }));
                }
                Wake::Cancelled => {
                    self.terminate(&mut child).await;
                    tail.forward(ctx, true).await;
                    return Err(ChildFailure::Fatal(NodeError::Cancelled));
                }
            }
        };
        tail.forward(ctx, true).await;

        self.outcome(files, status).await
    }

    async fn outcome(&self, files: &RunFiles, status: ExitStatus) -> Result<Outputs, ChildFailure> {
        if status.success() {
            return match files.read_result().await {
                Some(Ok(outputs)) => Ok(outputs),
                Some(Err(message)) => Err(ChildFailure::Fatal(NodeError::UnknownFailure(message))),
                None => Err(ChildFailure::Fatal(NodeError::UnknownFailure(
                    "child exited without writing a result".to_string(),
                ))),
            };
        }

        match files.read_error().await {
            Some(Ok(err)) if err.is_missing_dependency() => {
                Err(ChildFailure::MissingDependency(err))
            }
            Some(Ok(err)) => Err(ChildFailure::Fatal(err.into())),
            Some(Err(message)) => Err(ChildFailure::Fatal(NodeError::UnknownFailure(message))),
            None => Err(ChildFailure::Fatal(NodeError::UnknownFailure(format!(
                "child failed ({}) without writing an error",
                status
            )))),
        }
    }

    async fn terminate(&self, child: &mut Child) {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            kill_group(pid);
        }
        if let Err(e) = child.start_kill() {
            tracing::debug!("Kill failed, child probably exited: {}", e);
        }
        if tokio::time::timeout(self.config.grace_period, child.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                "Child not reaped within {}ms",
                self.config.grace_period.as_millis()
            );
        }
    }

    /// Map a result onto the declared output ports; undeclared components
    /// get the whole result.
    fn select_outputs(ctx: &NodeContext, mut result: Outputs) -> Outputs {
        if ctx.component.outputs.is_empty() {
            return result;
        }
        ctx.component
            .outputs
            .iter()
            .map(|port| {
                let value = result.remove(&port.name).unwrap_or_default();
                (port.name.clone(), value)
            })
            .collect()
    }
}

#[async_trait]
impl ComponentRunner for IsolationExecutor {
    fn runtime(&self) -> &str {
        self.template.runtime()
    }

    async fn run(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let mut output = self.execute(&ctx).await?;
        output.outputs = Self::select_outputs(&ctx, output.outputs);
        Ok(output)
    }
}

/// SIGKILL every process in the group led by `pid`.
#[cfg(unix)]
fn kill_group(pid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) takes no pointers; a negative pid addresses the group
    // created at spawn.
    if unsafe { libc::kill(-pgid, libc::SIGKILL) } != 0 {
        tracing::debug!(
            "Killing process group {} failed: {}",
            pgid,
            std::io::Error::last_os_error()
        );
    }
}

enum Wake {
    Exited(std::io::Result<ExitStatus>),
    Deadline,
    Cancelled,
    Tick,
}

/// Forwards new log bytes to the event stream, one event per line.
/// Bytes are buffered undecoded until a newline arrives, so a multi-byte
/// character split across two polls stays intact.
struct LogTail {
    path: PathBuf,
    offset: u64,
    pending: Vec<u8>,
}

impl LogTail {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            offset: 0,
            pending: Vec::new(),
        }
    }

    async fn forward(&mut self, ctx: &NodeContext, flush: bool) {
        if let Ok(chunk) = read_from(&self.path, self.offset).await {
            self.offset += chunk.len() as u64;
            self.pending.extend_from_slice(&chunk);
        }

        while let Some(end) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=end).collect();
            Self::emit(ctx, &line);
        }
        if flush && !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            Self::emit(ctx, &rest);
        }
    }

    fn emit(ctx: &NodeContext, bytes: &[u8]) {
        let text = String::from_utf8_lossy(bytes);
        let line = text.trim_end();
        tracing::debug!(node = %ctx.node_id, "{}", line);
        ctx.events.log(line);
    }
}

async fn read_from(path: &Path, offset: u64) -> std::io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).await?;
    Ok(buf)
}
