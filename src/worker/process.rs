use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, Notify};

use crate::cache::{CacheAllocationRequest, CacheInstance};
use crate::config::ProcessConfig;
use crate::error::{MeshError, Result};
use crate::logs::JobLogger;
use crate::model::{Action, ActionKind, JobContext};
use crate::shell::{Shell, Terminal};
use crate::worker::executor::{ExecutorDiscoverer, JobExecutor, JobRunnable, JobRuntime};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Placeholder in server step properties replaced by the job workspace.
pub const WORKSPACE_PLACEHOLDER: &str = "${workspace}";

const LAST_USED_MARKER: &str = ".last-used";

/// Runs command steps as local processes, one workspace directory per job.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    config: ProcessConfig,
}

impl ProcessExecutor {
    pub fn new(config: ProcessConfig) -> Self {
        Self { config }
    }

    async fn prepare_caches(
        &self,
        ctx: &JobContext,
        runtime: &Arc<dyn JobRuntime>,
        workspace: &Path,
    ) -> Result<()> {
        if ctx.cache_specs.is_empty() {
            return Ok(());
        }
        let cache_dir = self.config.cache_dir.clone();
        let instances = tokio::task::spawn_blocking(move || scan_caches(&cache_dir))
            .await
            .map_err(|e| MeshError::Internal(format!("cache scan failed: {}", e)))??;
        let request = CacheAllocationRequest {
            current_time: Utc::now(),
            instances,
        };
        let allocations = runtime.allocate_caches(ctx, request).await?;

        for (instance, path) in allocations {
            let directory = instance.directory(&self.config.cache_dir);
            match path {
                Some(path) => {
                    tokio::fs::create_dir_all(&directory).await?;
                    tokio::fs::write(directory.join(LAST_USED_MARKER), Utc::now().to_rfc3339()).await?;
                    let link = workspace.join(path.trim_start_matches('/'));
                    if let Some(parent) = link.parent() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                    tokio::fs::symlink(&directory, &link).await?;
                    tracing::debug!(
                        build_id = %ctx.build_id,
                        cache = %instance.name,
                        path = %path,
                        "Mounted cache"
                    );
                }
                None => {
                    tracing::debug!(cache = %instance.name, key = %instance.key, "Deleting idle cache");
                    if let Err(e) = tokio::fs::remove_dir_all(&directory).await {
                        tracing::warn!(cache = %instance.name, error = %e, "Failed to delete cache");
                    }
                }
            }
        }
        Ok(())
    }
}

/// Cache instances under `cache_dir`, laid out as `<key>/<name>`, with the
/// time they were last used.
pub fn scan_caches(cache_dir: &Path) -> Result<Vec<(CacheInstance, DateTime<Utc>)>> {
    let mut instances = Vec::new();
    if !cache_dir.exists() {
        return Ok(instances);
    }
    for key_entry in std::fs::read_dir(cache_dir)? {
        let key_entry = key_entry?;
        if !key_entry.file_type()?.is_dir() {
            continue;
        }
        let key = key_entry.file_name().to_string_lossy().into_owned();
        for entry in std::fs::read_dir(key_entry.path())? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let marker = entry.path().join(LAST_USED_MARKER);
            let modified = std::fs::metadata(&marker)
                .or_else(|_| entry.metadata())?
                .modified()
                .unwrap_or(SystemTime::UNIX_EPOCH);
            instances.push((
                CacheInstance {
                    name: entry.file_name().to_string_lossy().into_owned(),
                    key: key.clone(),
                },
                DateTime::<Utc>::from(modified),
            ));
        }
    }
    Ok(instances)
}

#[async_trait]
impl JobExecutor for ProcessExecutor {
    async fn execute(&self, ctx: &JobContext, runtime: Arc<dyn JobRuntime>, logger: &JobLogger) -> Result<()> {
        let workspace = self.config.work_dir.join(&ctx.job_token);
        tokio::fs::create_dir_all(&workspace).await?;
        runtime
            .report_job_workspace(ctx, &workspace.display().to_string())
            .await?;

        let result = async {
            runtime.copy_dependencies(ctx, &workspace).await?;
            self.prepare_caches(ctx, &runtime, &workspace).await?;
            let runnable = Arc::new(ProcessRunnable {
                ctx: ctx.clone(),
                runtime: runtime.clone(),
                workspace: workspace.clone(),
                shell: self.config.shell.clone(),
                pause_on_failure: self.config.pause_on_failure,
                resumed: Notify::new(),
            });
            runtime.run_job_local(ctx, runnable).await
        }
        .await;

        if let Err(e) = tokio::fs::remove_dir_all(&workspace).await {
            tracing::warn!(build_id = %ctx.build_id, error = %e, "Failed to clean job workspace");
        }
        if result.is_ok() {
            logger.log("Job workspace cleaned up");
        }
        result
    }
}

/// A job being run by [`ProcessExecutor`] on this node.
pub struct ProcessRunnable {
    ctx: JobContext,
    runtime: Arc<dyn JobRuntime>,
    workspace: PathBuf,
    shell: String,
    pause_on_failure: bool,
    resumed: Notify,
}

impl ProcessRunnable {
    fn run_actions<'a>(
        &'a self,
        actions: &'a [Action],
        prefix: Vec<usize>,
        logger: &'a JobLogger,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            for (index, action) in actions.iter().enumerate() {
                let mut position = prefix.clone();
                position.push(index);
                match &action.kind {
                    ActionKind::Composite { actions } => {
                        self.run_actions(actions, position, logger).await?;
                    }
                    ActionKind::Command { image, commands } => {
                        logger.log(format!("Running step \"{}\"...", action.name));
                        if let Some(image) = image {
                            logger.warning(format!("Image '{}' ignored by process executor", image));
                        }
                        if let Err(e) = self.run_command(commands, logger).await {
                            if self.pause_on_failure {
                                self.pause(logger).await?;
                            }
                            return Err(e);
                        }
                    }
                    ActionKind::Server { .. } => {
                        logger.log(format!("Running server step \"{}\"...", action.name));
                        self.run_server_step(&position).await?;
                    }
                }
            }
            Ok(())
        })
    }

    async fn pause(&self, logger: &JobLogger) -> Result<()> {
        logger.warning("Job paused after failed step, waiting to be resumed...");
        let resumed = self.resumed.notified();
        self.runtime.report_paused(&self.ctx).await?;
        resumed.await;
        logger.log("Job resumed");
        Ok(())
    }

    async fn run_command(&self, commands: &str, logger: &JobLogger) -> Result<()> {
        let mut child = Command::new(&self.shell)
            .arg("-c")
            .arg(commands)
            .current_dir(&self.workspace)
            .env("BUILD_NUMBER", self.ctx.build_number.to_string())
            .env("JOB_NAME", &self.ctx.job_name)
            .env("COMMIT_HASH", &self.ctx.commit_hash)
            .env("REF_NAME", &self.ctx.ref_name)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = forward_lines(child.stdout.take(), logger);
        let stderr = forward_lines(child.stderr.take(), logger);
        let (status, _, _) = tokio::join!(child.wait(), stdout, stderr);
        let status = status?;
        if status.success() {
            return Ok(());
        }
        let message = match status.code() {
            Some(code) => format!("Command exited with code {}", code),
            None => "Command terminated by signal".to_string(),
        };
        logger.error(&message);
        Err(MeshError::JobFailed(message))
    }

    async fn run_server_step(&self, position: &[usize]) -> Result<()> {
        let mut placeholders = BTreeMap::new();
        placeholders.insert(
            WORKSPACE_PLACEHOLDER.to_string(),
            self.workspace.display().to_string(),
        );
        let files = self
            .runtime
            .run_server_step(&self.ctx, position, &self.workspace, &placeholders, true)
            .await?;
        for (relative, content) in files {
            let target = self.workspace.join(&relative);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(target, content).await?;
        }
        Ok(())
    }
}

async fn forward_lines<R: AsyncRead + Unpin>(reader: Option<R>, logger: &JobLogger) {
    let Some(reader) = reader else {
        return;
    };
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => logger.log(line),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(build_id = %logger.build_id(), error = %e, "Output stream failed");
                break;
            }
        }
    }
}

#[async_trait]
impl JobRunnable for ProcessRunnable {
    async fn run(&self, logger: &JobLogger) -> Result<()> {
        self.run_actions(&self.ctx.actions, Vec::new(), logger).await
    }

    async fn resume(&self, _ctx: &JobContext) -> Result<()> {
        self.resumed.notify_one();
        Ok(())
    }

    async fn open_shell(&self, _ctx: &JobContext, terminal: Arc<dyn Terminal>) -> Result<Arc<dyn Shell>> {
        let shell = ProcessShell::spawn(&self.shell, &self.workspace, terminal)?;
        Ok(Arc::new(shell))
    }
}

/// Shell process in the job workspace, its output streamed to a terminal.
pub struct ProcessShell {
    stdin: Mutex<Option<ChildStdin>>,
    child: Mutex<Child>,
}

impl ProcessShell {
    pub fn spawn(shell: &str, workspace: &Path, terminal: Arc<dyn Terminal>) -> Result<Self> {
        let mut child = Command::new(shell)
            .current_dir(workspace)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        tokio::spawn(async move {
            tokio::join!(
                stream_output(stdout, terminal.as_ref()),
                stream_output(stderr, terminal.as_ref())
            );
            terminal.close();
        });
        Ok(Self {
            stdin: Mutex::new(stdin),
            child: Mutex::new(child),
        })
    }
}

async fn stream_output<R: AsyncRead + Unpin>(reader: Option<R>, terminal: &dyn Terminal) {
    let Some(reader) = reader else {
        return;
    };
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        terminal.send_output(&format!("{}\n", line));
    }
}

#[async_trait]
impl Shell for ProcessShell {
    async fn send_input(&self, input: &str) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        let stdin = stdin
            .as_mut()
            .ok_or_else(|| MeshError::Explicit("Shell already exited".to_string()))?;
        stdin.write_all(input.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        tracing::debug!(rows, cols, "Process shell has no terminal to resize");
        Ok(())
    }

    async fn exit(&self) -> Result<()> {
        self.stdin.lock().await.take();
        if let Err(e) = self.child.lock().await.start_kill() {
            tracing::debug!(error = %e, "Shell process already exited");
        }
        Ok(())
    }
}

/// Offers a [`ProcessExecutor`] whenever its shell can be found.
#[derive(Debug, Clone)]
pub struct ProcessDiscoverer {
    config: ProcessConfig,
}

impl ProcessDiscoverer {
    pub fn new(config: ProcessConfig) -> Self {
        Self { config }
    }
}

impl ExecutorDiscoverer for ProcessDiscoverer {
    fn order(&self) -> i32 {
        100
    }

    fn discover(&self) -> Option<Arc<dyn JobExecutor>> {
        if shell_available(&self.config.shell) {
            Some(Arc::new(ProcessExecutor::new(self.config.clone())))
        } else {
            None
        }
    }
}

/// Whether `shell` is an existing path or found on `PATH`.
pub fn shell_available(shell: &str) -> bool {
    let path = Path::new(shell);
    if path.components().count() > 1 {
        return path.exists();
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(shell).exists()))
        .unwrap_or(false)
}
