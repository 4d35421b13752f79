use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{MeshError, Result};
use crate::events::BuildEvent;
use crate::logs::JobLogger;
use crate::model::{ref_to_branch, Action, Build, BuildStatus, JobContext, JobSpec, ParamType, Project};
use crate::node::JobManager;
use crate::worker::execution::JobExecution;
use crate::worker::executor::{JobExecutor, JobRuntime, MatchTarget, ResolvedExecutor};
use crate::worker::interpolate::InterpolationContext;
use crate::worker::retry::{retry_delay, should_retry};

impl JobManager {
    /// Starts executing a pending build on this node.
    ///
    /// Resolution errors (missing spec, executor, bad interpolation) are
    /// returned directly; everything after that is reported through the
    /// returned [`JobExecution`].
    pub(crate) async fn execute(&self, build: &Build) -> Result<JobExecution> {
        let (project, job, services) =
            self.load_job(build.project_id, &build.commit_hash, &build.job_name)?;
        let job_token = uuid::Uuid::new_v4().to_string();

        let mut interpolation = InterpolationContext::new(&project.path, build, self.secrets.as_ref());
        let executor_name = job
            .executor
            .as_deref()
            .map(|name| interpolation.interpolate(name))
            .transpose()?;
        let executor = self
            .executors
            .resolve(executor_name.as_deref(), &self.match_targets(&project, build))?;
        let actions = interpolation.interpolate_steps(&job.steps)?;
        let cache_specs = interpolation.interpolate_caches(&job.caches)?;
        let services = interpolation.interpolate_services(&services)?;

        let mut masks = vec![job_token.clone()];
        masks.extend(interpolation.revealed_secrets().iter().cloned());
        masks.extend(
            build
                .params
                .values()
                .filter(|param| param.param_type == ParamType::Secret)
                .flat_map(|param| param.values.iter().cloned()),
        );
        let logger = JobLogger::new(build.id, self.logs.clone()).with_masks(masks);

        let context = JobContext {
            job_token: job_token.clone(),
            executor: executor.settings.clone(),
            project_id: project.id,
            project_path: project.path.clone(),
            build_id: build.id,
            build_number: build.number,
            job_name: build.job_name.clone(),
            ref_name: build.ref_name.clone(),
            commit_hash: build.commit_hash.clone(),
            actions: actions.clone(),
            cache_specs,
            services,
            retried: 0,
        };

        let timeout = Duration::from_secs(job.timeout);
        let cancel = CancellationToken::new();
        let begin = Arc::new(Mutex::new(Instant::now()));
        let attempts = Attempts {
            manager: self.arc()?,
            context,
            actions,
            job,
            executor,
            logger: logger.clone(),
            cancel: cancel.clone(),
            begin: begin.clone(),
        };
        tracing::info!(build_id = %build.id, job = %build.job_name, "Starting job execution");
        let handle = tokio::spawn(attempts.run());

        Ok(JobExecution::new(
            job_token,
            handle,
            cancel,
            begin,
            timeout,
            logger,
        ))
    }

    /// Pull request builds must satisfy executor requirements on both the
    /// source and the target side.
    fn match_targets(&self, project: &Project, build: &Build) -> Vec<MatchTarget> {
        let request = build
            .request
            .and_then(|id| self.projects.pull_request(id));
        match request {
            Some(request) => {
                let source_path = request
                    .source_project
                    .and_then(|id| self.projects.project(id))
                    .map_or_else(|| project.path.clone(), |p| p.path);
                vec![
                    MatchTarget {
                        project_path: source_path,
                        branch: request.source_branch.clone(),
                        job_name: build.job_name.clone(),
                    },
                    MatchTarget {
                        project_path: project.path.clone(),
                        branch: Some(request.target_branch.clone()),
                        job_name: build.job_name.clone(),
                    },
                ]
            }
            None => vec![MatchTarget {
                project_path: project.path.clone(),
                branch: ref_to_branch(&build.ref_name).map(str::to_string),
                job_name: build.job_name.clone(),
            }],
        }
    }
}

/// The spawned side of one execution: every attempt of the job.
struct Attempts {
    manager: Arc<JobManager>,
    context: JobContext,
    actions: Vec<Action>,
    job: JobSpec,
    executor: ResolvedExecutor,
    logger: JobLogger,
    cancel: CancellationToken,
    begin: Arc<Mutex<Instant>>,
}

impl Attempts {
    async fn run(self) -> Result<()> {
        let build_id = self.context.build_id;
        let _permit = tokio::select! {
            permit = self.manager.worker_permits.clone().acquire_owned() => permit
                .map_err(|_| MeshError::Internal("worker pool closed".to_string()))?,
            _ = self.cancel.cancelled() => return Err(MeshError::Cancelled { canceller: None }),
        };
        *self.begin.lock() = Instant::now();

        let mut retried = 0;
        loop {
            let ctx = JobContext {
                retried,
                ..self.context.clone()
            };
            let error = match self.attempt(&ctx).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            let build = self
                .manager
                .builds
                .get(build_id)
                .ok_or(MeshError::BuildNotFound(build_id))?;
            if self.cancel.is_cancelled() || !should_retry(&self.job, &build, &error, retried) {
                return Err(error);
            }

            if error.is_expected_failure() {
                // Cause already logged by the executor
            } else if error.is_explicit() {
                self.logger.error(error.to_string());
            } else {
                self.logger.error("Error running job");
                tracing::error!(build_id = %build_id, error = %error, "Error running job");
            }
            self.logger.warning("Job will be retried after a while...");

            let build = self.manager.update_build(build_id, |b| {
                b.status = BuildStatus::Waiting;
                b.retry_date = Some(Utc::now());
                b.pending_date = None;
                b.running_date = None;
            })?;
            self.manager.events.publish(BuildEvent::Retrying(build));

            let delay = retry_delay(self.job.retry_delay, retried);
            tracing::info!(
                build_id = %build_id,
                retried,
                delay_secs = delay.as_secs(),
                "Retrying job after delay"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => return Err(MeshError::Cancelled { canceller: None }),
            }
            retried += 1;

            *self.begin.lock() = Instant::now();
            let build = self.manager.update_build(build_id, Build::mark_pending)?;
            self.manager.events.publish(BuildEvent::Pending(build));
        }
    }

    /// One attempt with its registrations. Teardown runs whatever the
    /// attempt returned.
    async fn attempt(&self, ctx: &JobContext) -> Result<()> {
        let token = ctx.job_token.clone();
        self.manager.job_contexts.put(&token, ctx).await?;
        self.manager
            .job_actions
            .lock()
            .insert(token.clone(), self.actions.clone());
        self.manager
            .job_loggers
            .lock()
            .insert(token.clone(), self.logger.clone());
        self.manager
            .server_step_tokens
            .lock()
            .insert(token.clone(), CancellationToken::new());

        let result = self.run_executor(ctx).await;

        if let Some(steps) = self.manager.server_step_tokens.lock().remove(&token) {
            steps.cancel();
        }
        self.manager.job_loggers.lock().remove(&token);
        self.manager.job_actions.lock().remove(&token);
        self.manager.job_runnables.lock().remove(&token);
        if let Err(e) = self.manager.job_servers.remove(&token).await {
            tracing::warn!(build_id = %ctx.build_id, error = %e, "Failed to unregister job server");
        }
        if let Err(e) = self.manager.job_contexts.remove(&token).await {
            tracing::warn!(build_id = %ctx.build_id, error = %e, "Failed to remove job context");
        }
        result
    }

    async fn run_executor(&self, ctx: &JobContext) -> Result<()> {
        let build = self.manager.update_build(ctx.build_id, |b| {
            b.status = BuildStatus::Running;
            b.running_date = Some(Utc::now());
        })?;
        self.manager.events.publish(BuildEvent::Running(build));
        self.logger.log(format!(
            "Executing job (executor: {}, retried: {})...",
            ctx.executor.name, ctx.retried
        ));

        let runtime: Arc<dyn JobRuntime> = self.manager.clone();
        let backend: &Arc<dyn JobExecutor> = &self.executor.backend;
        tokio::select! {
            result = backend.execute(ctx, runtime, &self.logger) => result,
            _ = self.cancel.cancelled() => Err(MeshError::Cancelled { canceller: None }),
        }
    }
}
