use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::auth::{AccessControl, SecretResolver};
use crate::cache::{CacheAllocationRequest, CacheAllocations};
use crate::cluster::dispatch::RemoteLogSink;
use crate::cluster::shared::{ALLOCATED_CACHES, JOB_CONTEXTS, JOB_SERVERS};
use crate::cluster::{
    ClusterCoordinator, ClusterTask, Dispatcher, SharedMap, SharedStore, TaskHandler, TaskOutput,
};
use crate::config::EngineConfig;
use crate::error::{MeshError, Result};
use crate::events::{BuildEvent, EventBus};
use crate::logs::{JobLogger, LogSink};
use crate::model::{Action, ActionKind, Build, BuildId, JobContext, NodeId, ProjectId, UserId};
use crate::scheduler::trigger::TaskScheduler;
use crate::shell::{Shell, Terminal};
use crate::steps::{ServerStep, ServerStepRunner};
use crate::store::artifacts::list_files;
use crate::store::{ArtifactStore, BuildStore, ProjectStore};
use crate::worker::execution::JobExecution;
use crate::worker::executor::{ExecutorRegistry, JobRunnable, JobRuntime};

/// Collaborators a [`JobManager`] consumes.
#[derive(Clone)]
pub struct Services {
    pub builds: Arc<dyn BuildStore>,
    pub projects: Arc<dyn ProjectStore>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub secrets: Arc<dyn SecretResolver>,
    pub access: Arc<dyn AccessControl>,
    pub logs: Arc<dyn LogSink>,
    pub server_steps: Arc<dyn ServerStepRunner>,
    pub shared: Arc<dyn SharedStore>,
}

/// Per-node job orchestration: submission, reconciliation, execution,
/// cache allocation and shell proxying all hang off this object.
///
/// State shared by the cluster lives in the injected [`SharedStore`];
/// everything else here is node-local.
pub struct JobManager {
    pub(crate) this: Weak<JobManager>,
    pub(crate) config: EngineConfig,
    pub(crate) builds: Arc<dyn BuildStore>,
    pub(crate) projects: Arc<dyn ProjectStore>,
    pub(crate) artifacts: Arc<dyn ArtifactStore>,
    pub(crate) secrets: Arc<dyn SecretResolver>,
    pub(crate) access: Arc<dyn AccessControl>,
    pub(crate) logs: Arc<dyn LogSink>,
    pub(crate) server_steps: Arc<dyn ServerStepRunner>,
    pub(crate) shared: Arc<dyn SharedStore>,
    pub(crate) events: EventBus,
    pub(crate) coordinator: Arc<dyn ClusterCoordinator>,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) executors: ExecutorRegistry,

    pub(crate) job_contexts: SharedMap<JobContext>,
    pub(crate) job_servers: SharedMap<NodeId>,
    pub(crate) allocated_caches: SharedMap<Vec<String>>,

    pub(crate) executions: Mutex<HashMap<BuildId, JobExecution>>,
    pub(crate) server_step_tokens: Mutex<HashMap<String, CancellationToken>>,
    pub(crate) job_actions: Mutex<HashMap<String, Vec<Action>>>,
    pub(crate) job_runnables: Mutex<HashMap<String, Arc<dyn JobRunnable>>>,
    pub(crate) job_loggers: Mutex<HashMap<String, JobLogger>>,
    pub(crate) shells: Mutex<HashMap<String, Arc<dyn Shell>>>,
    pub(crate) terminals: Mutex<HashMap<String, Arc<dyn Terminal>>>,
    pub(crate) submit_locks: Mutex<HashMap<(ProjectId, String), Arc<tokio::sync::Mutex<()>>>>,
    pub(crate) triggers: TaskScheduler,
    pub(crate) scheduled: Mutex<HashMap<ProjectId, Vec<String>>>,

    pub(crate) running: AtomicBool,
    pub(crate) started: watch::Sender<bool>,
    pub(crate) worker_permits: Arc<Semaphore>,
    reconciler: Mutex<Option<JoinHandle<()>>>,
}

impl JobManager {
    pub fn new(
        config: EngineConfig,
        services: Services,
        coordinator: Arc<dyn ClusterCoordinator>,
        executors: ExecutorRegistry,
    ) -> Arc<Self> {
        let manager = Arc::new_cyclic(|this| {
            let (started, _) = watch::channel(false);
            JobManager {
                this: this.clone(),
                events: EventBus::new(config.event_capacity),
                worker_permits: Arc::new(Semaphore::new(config.worker_pool_size.max(1))),
                config,
                dispatcher: Dispatcher::new(coordinator.clone(), services.projects.clone()),
                job_contexts: SharedMap::new(JOB_CONTEXTS, services.shared.clone()),
                job_servers: SharedMap::new(JOB_SERVERS, services.shared.clone()),
                allocated_caches: SharedMap::new(ALLOCATED_CACHES, services.shared.clone()),
                builds: services.builds,
                projects: services.projects,
                artifacts: services.artifacts,
                secrets: services.secrets,
                access: services.access,
                logs: services.logs,
                server_steps: services.server_steps,
                shared: services.shared,
                coordinator,
                executors,
                executions: Mutex::new(HashMap::new()),
                server_step_tokens: Mutex::new(HashMap::new()),
                job_actions: Mutex::new(HashMap::new()),
                job_runnables: Mutex::new(HashMap::new()),
                job_loggers: Mutex::new(HashMap::new()),
                shells: Mutex::new(HashMap::new()),
                terminals: Mutex::new(HashMap::new()),
                submit_locks: Mutex::new(HashMap::new()),
                triggers: TaskScheduler::new(),
                scheduled: Mutex::new(HashMap::new()),
                running: AtomicBool::new(false),
                started,
                reconciler: Mutex::new(None),
            }
        });
        let handler: Weak<dyn TaskHandler> = Arc::downgrade(&manager) as Weak<dyn TaskHandler>;
        manager.coordinator.register_handler(handler);
        manager
    }

    pub(crate) fn arc(&self) -> Result<Arc<JobManager>> {
        self.this
            .upgrade()
            .ok_or_else(|| MeshError::Internal("job manager is shutting down".to_string()))
    }

    /// Publishes a finished build and runs its follow-ups in the background.
    pub(crate) fn publish_finished(&self, build: Build) {
        self.events.publish(BuildEvent::Finished(build.clone()));
        match self.arc() {
            Ok(this) => {
                tokio::spawn(async move { this.on_build_finished(build).await });
            }
            Err(e) => tracing::warn!(build_id = %build.id, error = %e, "Skipping post build processing"),
        }
    }

    pub fn local_node(&self) -> NodeId {
        self.coordinator.local_node()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn build(&self, id: BuildId) -> Option<Build> {
        self.builds.get(id)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Starts the reconciliation loop and schedules cron triggers of every
    /// project stored on this node.
    pub fn start(&self) -> Result<()> {
        let this = self.arc()?;
        self.running.store(true, Ordering::SeqCst);
        *self.reconciler.lock() = Some(tokio::spawn(async move { this.reconcile_loop().await }));

        let local = self.local_node();
        for project_id in self.projects.projects() {
            if self.projects.storage_node(project_id) == Some(local) {
                self.schedule(project_id);
            }
        }
        self.started.send_replace(true);
        tracing::info!(node_id = %local, "Job manager started");
        Ok(())
    }

    /// Stops taking new work. The reconciliation loop keeps resolving local
    /// executions until none remain.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        tracing::info!(node_id = %self.local_node(), "Job manager stopping");
    }

    /// Stops and waits for the reconciliation loop to drain.
    pub async fn shutdown(&self) {
        self.stop();
        let handle = self.reconciler.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Reconciliation loop ended abnormally");
            }
        }
    }

    pub fn execution_count(&self) -> usize {
        self.executions.lock().len()
    }

    /// Applies `change` to a build inside a store transaction.
    pub(crate) fn update_build(&self, id: BuildId, mut change: impl FnMut(&mut Build)) -> Result<Build> {
        self.builds.modify(id, &mut change)
    }

    pub async fn cancel(&self, build_id: BuildId, canceller: Option<UserId>) -> Result<()> {
        let build = self
            .builds
            .get(build_id)
            .ok_or(MeshError::BuildNotFound(build_id))?;
        let task = ClusterTask::CancelBuild {
            build_id,
            canceller,
        };
        self.dispatcher
            .run_on_project_node(build.project_id, task, &CancellationToken::new())
            .await?;
        Ok(())
    }

    pub(crate) fn cancel_local(&self, build_id: BuildId, canceller: Option<UserId>) -> Result<()> {
        if let Some(execution) = self.executions.lock().get(&build_id) {
            tracing::info!(build_id = %build_id, "Cancelling job execution");
            execution.cancel(canceller);
            return Ok(());
        }
        let mut cancelled = false;
        let build = self.update_build(build_id, |b| {
            if !b.is_finished() {
                b.finish(crate::model::BuildStatus::Cancelled);
                b.canceller = canceller;
                cancelled = true;
            }
        })?;
        if cancelled {
            tracing::info!(build_id = %build_id, "Build cancelled before execution");
            self.publish_finished(build);
        }
        Ok(())
    }

    /// Resumes a paused job on whichever node runs it.
    pub async fn resume(&self, build_id: BuildId) -> Result<()> {
        let ctx = self
            .get_job_context_by_build(build_id)
            .await?
            .ok_or(MeshError::JobContextNotFound)?;
        let node = self
            .job_servers
            .get(&ctx.job_token)
            .await?
            .ok_or(MeshError::JobContextNotFound)?;
        self.dispatcher
            .run_on_node(
                node,
                ClusterTask::ResumeJob {
                    job_token: ctx.job_token.clone(),
                },
                &CancellationToken::new(),
            )
            .await?;
        let build = self.update_build(build_id, |b| b.paused = false)?;
        self.events.publish(BuildEvent::Updated(build));
        Ok(())
    }

    async fn resume_local(&self, job_token: &str) -> Result<()> {
        let runnable = self
            .job_runnables
            .lock()
            .get(job_token)
            .cloned()
            .ok_or(MeshError::JobContextNotFound)?;
        let ctx = self
            .get_job_context(job_token, true)
            .await?
            .ok_or(MeshError::JobContextNotFound)?;
        runnable.resume(&ctx).await
    }

    pub async fn get_job_context(&self, job_token: &str, must_exist: bool) -> Result<Option<JobContext>> {
        let ctx = self.job_contexts.get(job_token).await?;
        if must_exist && ctx.is_none() {
            return Err(MeshError::JobContextNotFound);
        }
        Ok(ctx)
    }

    pub async fn get_job_context_by_build(&self, build_id: BuildId) -> Result<Option<JobContext>> {
        Ok(self
            .job_contexts
            .entries()
            .await?
            .into_iter()
            .map(|(_, ctx)| ctx)
            .find(|ctx| ctx.build_id == build_id))
    }

    /// Runs a cluster task on a specific node, giving up when `cancel` fires.
    pub async fn run_job(&self, node: NodeId, task: ClusterTask, cancel: &CancellationToken) -> Result<TaskOutput> {
        tracing::debug!(node = %node, task = task.name(), "Running job task on node");
        self.dispatcher.run_on_node(node, task, cancel).await
    }

    pub async fn run_job_local(&self, ctx: &JobContext, runnable: Arc<dyn JobRunnable>) -> Result<()> {
        let mut started = self.started.subscribe();
        started
            .wait_for(|started| *started)
            .await
            .map(|_| ())
            .map_err(|_| MeshError::Internal("job manager dropped".to_string()))?;

        self.job_servers
            .put(&ctx.job_token, &self.local_node())
            .await?;
        self.job_runnables
            .lock()
            .insert(ctx.job_token.clone(), runnable.clone());

        let registered = self.job_loggers.lock().get(&ctx.job_token).cloned();
        let logger = match registered {
            Some(logger) => logger,
            None => JobLogger::new(
                ctx.build_id,
                Arc::new(RemoteLogSink::new(self.dispatcher.clone(), ctx.project_id)),
            )
            .with_masks([ctx.job_token.clone()]),
        };

        let result = runnable.run(&logger).await;

        self.job_runnables.lock().remove(&ctx.job_token);
        if let Err(e) = self.job_servers.remove(&ctx.job_token).await {
            tracing::warn!(build_id = %ctx.build_id, error = %e, "Failed to unregister job server");
        }
        result
    }

    pub async fn report_job_workspace(&self, ctx: &JobContext, workspace: &str) -> Result<()> {
        let workspace = workspace.to_string();
        let build = self.update_build(ctx.build_id, |b| b.job_workspace = Some(workspace.clone()))?;
        self.events.publish(BuildEvent::Updated(build));
        Ok(())
    }

    pub async fn report_paused(&self, ctx: &JobContext) -> Result<()> {
        let build = self.update_build(ctx.build_id, |b| b.paused = true)?;
        self.events.publish(BuildEvent::Updated(build));
        Ok(())
    }

    /// Copies artifacts of dependency builds that declare an artifact
    /// pattern into `target_dir`.
    pub async fn copy_dependencies(&self, ctx: &JobContext, target_dir: &Path) -> Result<()> {
        let build = self
            .builds
            .get(ctx.build_id)
            .ok_or(MeshError::BuildNotFound(ctx.build_id))?;
        for dependence in &build.dependencies {
            let Some(patterns) = &dependence.artifacts else {
                continue;
            };
            let dependency = self
                .builds
                .get(dependence.dependency)
                .ok_or(MeshError::BuildNotFound(dependence.dependency))?;
            let target = match &dependence.destination_path {
                Some(path) => target_dir.join(path),
                None => target_dir.to_path_buf(),
            };
            let copied = self.artifacts.copy_artifacts(&dependency, patterns, &target)?;
            tracing::debug!(
                build_id = %build.id,
                dependency = %dependency.id,
                copied,
                "Copied dependency artifacts"
            );
        }
        Ok(())
    }

    /// Runs a server step of the job on the node storing the project,
    /// uploading every file below `input_dir`.
    pub async fn run_server_step(
        &self,
        ctx: &JobContext,
        position: &[usize],
        input_dir: &Path,
        placeholders: &BTreeMap<String, String>,
        call_by_agent: bool,
    ) -> Result<BTreeMap<String, Vec<u8>>> {
        let mut files = BTreeMap::new();
        if input_dir.exists() {
            for relative in list_files(input_dir)? {
                let content = tokio::fs::read(input_dir.join(&relative)).await?;
                files.insert(relative, content);
            }
        }
        let task = ClusterTask::RunServerStep {
            job_token: ctx.job_token.clone(),
            position: position.to_vec(),
            files,
            placeholders: placeholders.clone(),
            call_by_agent,
        };
        match self
            .dispatcher
            .run_on_project_node(ctx.project_id, task, &CancellationToken::new())
            .await?
        {
            TaskOutput::Files(files) => Ok(files),
            other => Err(MeshError::Internal(format!(
                "unexpected server step output: {:?}",
                other
            ))),
        }
    }

    async fn run_server_step_local(
        &self,
        job_token: &str,
        position: &[usize],
        files: BTreeMap<String, Vec<u8>>,
        placeholders: &BTreeMap<String, String>,
        call_by_agent: bool,
    ) -> Result<BTreeMap<String, Vec<u8>>> {
        let ctx = self
            .get_job_context(job_token, true)
            .await?
            .ok_or(MeshError::JobContextNotFound)?;
        let action = self
            .job_actions
            .lock()
            .get(job_token)
            .and_then(|actions| Action::locate(actions, position).cloned())
            .ok_or_else(|| MeshError::Explicit(format!("No step found at position {:?}", position)))?;
        let ActionKind::Server {
            step_type,
            properties,
        } = action.kind
        else {
            return Err(MeshError::Explicit(format!(
                "Step '{}' is not a server step",
                action.name
            )));
        };
        let properties = properties
            .into_iter()
            .map(|(name, mut value)| {
                for (placeholder, replacement) in placeholders {
                    value = value.replace(placeholder.as_str(), replacement);
                }
                (name, value)
            })
            .collect();

        let cancel = self
            .server_step_tokens
            .lock()
            .get(job_token)
            .map(CancellationToken::child_token)
            .unwrap_or_else(CancellationToken::new);
        let logger = if call_by_agent {
            self.job_loggers.lock().get(job_token).cloned()
        } else {
            None
        };
        let step = ServerStep {
            project_id: ctx.project_id,
            build_id: ctx.build_id,
            build_number: ctx.build_number,
            step_type,
            properties,
            input_files: files,
            logger,
        };
        self.server_steps.run(step, cancel).await
    }
}

#[async_trait]
impl TaskHandler for JobManager {
    async fn handle(&self, origin: NodeId, task: ClusterTask) -> Result<TaskOutput> {
        tracing::trace!(origin = %origin, task = task.name(), "Handling cluster task");
        match task {
            ClusterTask::ReconcileBuilds { builds } => {
                self.reconcile_builds(&builds).await;
                Ok(TaskOutput::Done)
            }
            ClusterTask::CancelBuild {
                build_id,
                canceller,
            } => {
                self.cancel_local(build_id, canceller)?;
                Ok(TaskOutput::Done)
            }
            ClusterTask::ResumeJob { job_token } => {
                self.resume_local(&job_token).await?;
                Ok(TaskOutput::Done)
            }
            ClusterTask::CleanBuildDir {
                project_id,
                build_number,
            } => {
                self.artifacts.clean_build_dir(project_id, build_number)?;
                Ok(TaskOutput::Done)
            }
            ClusterTask::AllocateCaches { job_token, request } => {
                let allocations = self.allocate_caches_locked(&job_token, &request).await?;
                Ok(TaskOutput::Caches(allocations.into_iter().collect()))
            }
            ClusterTask::OpenShell {
                job_token,
                session_id,
                origin,
            } => {
                self.open_shell_local(&job_token, &session_id, origin).await?;
                Ok(TaskOutput::Done)
            }
            ClusterTask::ShellInput { session_id, input } => {
                self.local_shell(&session_id)?.send_input(&input).await?;
                Ok(TaskOutput::Done)
            }
            ClusterTask::ShellResize {
                session_id,
                rows,
                cols,
            } => {
                self.local_shell(&session_id)?.resize(rows, cols).await?;
                Ok(TaskOutput::Done)
            }
            ClusterTask::ShellExit { session_id } => {
                let shell = self.shells.lock().remove(&session_id);
                if let Some(shell) = shell {
                    shell.exit().await?;
                }
                Ok(TaskOutput::Done)
            }
            ClusterTask::TerminalOutput {
                session_id,
                output,
                closed,
            } => {
                self.terminal_output(&session_id, &output, closed);
                Ok(TaskOutput::Done)
            }
            ClusterTask::AppendLog { build_id, line } => {
                self.logs.append(build_id, line);
                Ok(TaskOutput::Done)
            }
            ClusterTask::RunServerStep {
                job_token,
                position,
                files,
                placeholders,
                call_by_agent,
            } => {
                let files = self
                    .run_server_step_local(&job_token, &position, files, &placeholders, call_by_agent)
                    .await?;
                Ok(TaskOutput::Files(files))
            }
            ClusterTask::Shared(op) => Ok(TaskOutput::Shared(self.shared.apply(op).await?)),
            ClusterTask::Ping => Ok(TaskOutput::Done),
        }
    }
}

#[async_trait]
impl JobRuntime for JobManager {
    async fn run_job_local(&self, ctx: &JobContext, runnable: Arc<dyn JobRunnable>) -> Result<()> {
        JobManager::run_job_local(self, ctx, runnable).await
    }

    async fn allocate_caches(&self, ctx: &JobContext, request: CacheAllocationRequest) -> Result<CacheAllocations> {
        JobManager::allocate_caches(self, ctx, request).await
    }

    async fn copy_dependencies(&self, ctx: &JobContext, target_dir: &Path) -> Result<()> {
        JobManager::copy_dependencies(self, ctx, target_dir).await
    }

    async fn run_server_step(
        &self,
        ctx: &JobContext,
        position: &[usize],
        input_dir: &Path,
        placeholders: &BTreeMap<String, String>,
        call_by_agent: bool,
    ) -> Result<BTreeMap<String, Vec<u8>>> {
        JobManager::run_server_step(self, ctx, position, input_dir, placeholders, call_by_agent).await
    }

    async fn report_job_workspace(&self, ctx: &JobContext, workspace: &str) -> Result<()> {
        JobManager::report_job_workspace(self, ctx, workspace).await
    }

    async fn report_paused(&self, ctx: &JobContext) -> Result<()> {
        JobManager::report_paused(self, ctx).await
    }
}
