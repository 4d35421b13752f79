use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::auth::Subject;
use crate::cluster::ClusterTask;
use crate::error::{MeshError, Result};
use crate::events::BuildEvent;
use crate::model::spec::matches_patterns;
use crate::model::{
    ref_to_branch, ref_to_tag, Build, BuildDependence, BuildId, BuildParam, BuildStatus, JobSpec,
    ParamMap, ParamMatrix, ParamSupply, ParamType, Project, ProjectDependency, ProjectId,
    RequestId, Service, TriggerKind, UserId,
};
use crate::node::JobManager;
use crate::scheduler::matrix;
use crate::worker::interpolate::InterpolationContext;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Everything needed to submit one job of a commit.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub project_id: ProjectId,
    pub commit_hash: String,
    pub job_name: String,
    pub params: ParamMap,
    pub pipeline: String,
    pub ref_name: String,
    pub submitter: Option<UserId>,
    pub request: Option<RequestId>,
    pub reason: String,
}

impl SubmitRequest {
    /// A request in a fresh pipeline with no params.
    pub fn new(
        project_id: ProjectId,
        commit_hash: impl Into<String>,
        job_name: impl Into<String>,
        ref_name: impl Into<String>,
    ) -> Self {
        Self {
            project_id,
            commit_hash: commit_hash.into(),
            job_name: job_name.into(),
            params: ParamMap::new(),
            pipeline: new_pipeline(),
            ref_name: ref_name.into(),
            submitter: None,
            request: None,
            reason: String::new(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, values: &[&str]) -> Self {
        self.params
            .insert(name.into(), values.iter().map(|v| v.to_string()).collect());
        self
    }

    pub fn with_params(mut self, params: ParamMap) -> Self {
        self.params = params;
        self
    }

    pub fn with_pipeline(mut self, pipeline: impl Into<String>) -> Self {
        self.pipeline = pipeline.into();
        self
    }

    pub fn with_submitter(mut self, submitter: UserId) -> Self {
        self.submitter = Some(submitter);
        self
    }

    pub fn with_request(mut self, request: RequestId) -> Self {
        self.request = Some(request);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }
}

pub fn new_pipeline() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Checks supplied values against the job's param specs and attaches types.
pub fn validate_params(job: &JobSpec, params: &ParamMap) -> Result<BTreeMap<String, BuildParam>> {
    if let Some(unknown) = params.keys().find(|name| job.param_spec(name).is_none()) {
        return Err(MeshError::ParamInvalid(format!("Unknown param: {}", unknown)));
    }

    let mut typed = BTreeMap::new();
    for spec in &job.params {
        let values = params
            .get(&spec.name)
            .ok_or_else(|| MeshError::ParamInvalid(format!("Missing param: {}", spec.name)))?;
        if values.is_empty() && !spec.allow_empty {
            return Err(MeshError::ParamInvalid(format!(
                "A value is required for param: {}",
                spec.name
            )));
        }
        if values.len() > 1 && !spec.allow_multiple {
            return Err(MeshError::ParamInvalid(format!(
                "Multiple values not allowed for param: {}",
                spec.name
            )));
        }
        for value in values {
            let valid = match &spec.param_type {
                ParamType::Integer => value.parse::<i64>().is_ok(),
                ParamType::Boolean => value == "true" || value == "false",
                ParamType::Choice { choices } => choices.contains(value),
                ParamType::Text | ParamType::Secret => true,
            };
            if !valid {
                return Err(MeshError::ParamInvalid(format!(
                    "Invalid value '{}' for param: {}",
                    value, spec.name
                )));
            }
        }
        typed.insert(
            spec.name.clone(),
            BuildParam {
                param_type: spec.param_type.clone(),
                values: values.clone(),
            },
        );
    }
    Ok(typed)
}

/// Trigger params are literal: every supplied alternative becomes a column
/// of the matrix.
pub(crate) fn trigger_matrix(params: &[ParamSupply]) -> ParamMatrix {
    params
        .iter()
        .map(|supply| (supply.name.clone(), supply.values.clone()))
        .collect()
}

impl JobManager {
    fn submit_lock(&self, project_id: ProjectId, commit: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.submit_locks
            .lock()
            .entry((project_id, commit.to_string()))
            .or_default()
            .clone()
    }

    fn release_submit_lock(&self, project_id: ProjectId, commit: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.submit_locks.lock();
        // Map entry plus ours: nobody else waits on it
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&(project_id, commit.to_string()));
        }
    }

    /// Submits a job and its dependencies, returning the build of the job.
    ///
    /// Submissions of the same commit are serialized, and an equivalent
    /// build (same key, same pipeline or still unfinished) is returned
    /// instead of creating a duplicate.
    pub async fn submit(&self, request: SubmitRequest) -> Result<Build> {
        let lock = self.submit_lock(request.project_id, &request.commit_hash);
        let guard = lock.clone().lock_owned().await;

        let mut created = Vec::new();
        let result = self.submit_locked(&request, &mut created);
        if let Err(e) = &result {
            for build in created.drain(..).rev() {
                self.builds.delete(build.id);
            }
            tracing::debug!(
                project_id = %request.project_id,
                job = %request.job_name,
                error = %e,
                "Submission rolled back"
            );
        }

        for build in &created {
            self.clean_build_dir(build).await;
            tracing::info!(
                build_id = %build.id,
                number = build.number,
                job = %build.job_name,
                reason = %build.submit_reason,
                "Build submitted"
            );
            self.events.publish(BuildEvent::Submitted(build.clone()));
        }

        drop(guard);
        self.release_submit_lock(request.project_id, &request.commit_hash, lock);

        if !created.is_empty() {
            let this = self.arc()?;
            tokio::spawn(async move {
                for build in created {
                    this.cancel_superseded(&build).await;
                }
            });
        }
        result
    }

    /// Project, job and the services the job requires at `commit`.
    pub(crate) fn load_job(
        &self,
        project_id: ProjectId,
        commit: &str,
        job_name: &str,
    ) -> Result<(Project, JobSpec, Vec<Service>)> {
        let project = self
            .projects
            .project(project_id)
            .ok_or_else(|| MeshError::ProjectNotFound(project_id.to_string()))?;
        let spec = self
            .projects
            .build_spec(project_id, commit)
            .ok_or_else(|| MeshError::SpecNotFound {
                project: project.path.clone(),
                commit: commit.to_string(),
            })?;
        spec.validate().map_err(|message| MeshError::SpecInvalid {
            project: project.path.clone(),
            commit: commit.to_string(),
            message,
        })?;
        let job = spec
            .job(job_name)
            .cloned()
            .ok_or_else(|| MeshError::JobNotFound {
                project: project.path.clone(),
                commit: commit.to_string(),
                job: job_name.to_string(),
            })?;
        let services = job
            .required_services
            .iter()
            .filter_map(|name| spec.service(name).cloned())
            .collect();
        Ok((project, job, services))
    }

    /// Runs with the commit lock held. Builds created along the way,
    /// dependencies first, are appended to `created` and deleted again by
    /// the caller when the submission fails.
    fn submit_locked(&self, request: &SubmitRequest, created: &mut Vec<Build>) -> Result<Build> {
        let (project, job, _) = self.load_job(request.project_id, &request.commit_hash, &request.job_name)?;
        let params = validate_params(&job, &request.params)?;

        let mut build = Build::new(
            request.project_id,
            request.commit_hash.clone(),
            request.job_name.clone(),
            request.ref_name.clone(),
            request.pipeline.clone(),
        );
        build.params = params;
        build.submitter = request.submitter;
        build.request = request.request;
        build.submit_reason = request.reason.clone();

        if let Some(existing) = self.builds.find_equivalent(&build.key(), &request.pipeline) {
            tracing::debug!(
                build_id = %existing.id,
                job = %existing.job_name,
                "Reusing equivalent build"
            );
            return Ok(existing);
        }

        for dependency in &job.job_dependencies {
            let supplies = InterpolationContext::new(&project.path, &build, self.secrets.as_ref())
                .interpolate_supplies(&dependency.params)?;
            for cell in matrix::expand(&supplies) {
                let sub = SubmitRequest {
                    job_name: dependency.job_name.clone(),
                    params: cell,
                    reason: format!("Required by job '{}'", job.name),
                    ..request.clone()
                };
                let dependency_build = self.submit_locked(&sub, created)?;
                build.dependencies.push(BuildDependence {
                    dependency: dependency_build.id,
                    require_successful: dependency.require_successful,
                    artifacts: dependency.artifacts.clone(),
                    destination_path: dependency.destination_path.clone(),
                });
            }
        }

        for dependency in &job.project_dependencies {
            let dependency = InterpolationContext::new(&project.path, &build, self.secrets.as_ref())
                .interpolate_project_dependency(dependency)?;
            let dependency_build = self.resolve_project_dependency(&project, request.submitter, &dependency)?;
            build.dependencies.push(BuildDependence {
                dependency: dependency_build.id,
                require_successful: true,
                artifacts: dependency.artifacts.clone(),
                destination_path: dependency.destination_path.clone(),
            });
        }

        let build = self.builds.create(build);
        created.push(build.clone());
        Ok(build)
    }

    fn resolve_project_dependency(
        &self,
        project: &Project,
        submitter: Option<UserId>,
        dependency: &ProjectDependency,
    ) -> Result<Build> {
        let target = self
            .projects
            .find_by_path(&dependency.project_path)
            .ok_or_else(|| {
                MeshError::Explicit(format!(
                    "Unable to find dependency project: {}",
                    dependency.project_path
                ))
            })?;

        let subject = match &dependency.access_token_secret {
            Some(secret) => {
                let token = self.secrets.secret(project.id, secret).ok_or_else(|| {
                    MeshError::Explicit(format!("Secret not found: {}", secret))
                })?;
                let user = self.access.user_by_access_token(&token).ok_or_else(|| {
                    MeshError::PermissionDenied(format!(
                        "Unable to access dependency project '{}': invalid access token",
                        dependency.project_path
                    ))
                })?;
                Subject::User(user)
            }
            None => Subject::Anonymous,
        };
        let permitted = self.access.can_access_build(&subject, target.id)
            || submitter.map_or(false, |user| {
                self.access.can_access_build(&Subject::User(user), target.id)
            });
        if !permitted {
            return Err(MeshError::PermissionDenied(format!(
                "Unable to access dependency project: {}",
                dependency.project_path
            )));
        }

        self.builds
            .find_by_selector(target.id, &dependency.build)
            .ok_or_else(|| {
                MeshError::Explicit(format!(
                    "Unable to find dependency build in project: {}",
                    dependency.project_path
                ))
            })
    }

    async fn clean_build_dir(&self, build: &Build) {
        let task = ClusterTask::CleanBuildDir {
            project_id: build.project_id,
            build_number: build.number,
        };
        if let Err(e) = self
            .dispatcher
            .run_on_project_node(build.project_id, task, &CancellationToken::new())
            .await
        {
            tracing::warn!(build_id = %build.id, error = %e, "Failed to clean build directory");
        }
    }

    /// Cancels strictly older unfinished builds of the same job, ref and
    /// params that `build` makes obsolete.
    async fn cancel_superseded(&self, build: &Build) {
        let candidates = self.builds.query_unfinished_matching(
            build.project_id,
            &build.job_name,
            &build.ref_name,
            build.request,
            &build.public_param_map(),
        );
        for old in candidates {
            if old.id == build.id || old.number >= build.number {
                continue;
            }
            let superseded = build.request.is_some()
                || self
                    .projects
                    .is_merged_into(build.project_id, &old.commit_hash, &build.commit_hash);
            if !superseded {
                continue;
            }
            tracing::info!(
                build_id = %old.id,
                superseded_by = %build.id,
                "Cancelling superseded build"
            );
            if let Err(e) = self.cancel(old.id, None).await {
                tracing::warn!(build_id = %old.id, error = %e, "Failed to cancel superseded build");
            }
        }
    }

    /// Puts a finished build back into WAITING, together with every required
    /// dependency that did not succeed.
    pub async fn resubmit(
        &self,
        build_id: BuildId,
        reason: impl Into<String>,
        submitter: Option<UserId>,
    ) -> Result<Build> {
        self.resubmit_boxed(build_id, reason.into(), submitter).await
    }

    fn resubmit_boxed(&self, build_id: BuildId, reason: String, submitter: Option<UserId>) -> BoxFuture<'_, Result<Build>> {
        Box::pin(async move {
            let existing = self
                .builds
                .get(build_id)
                .ok_or(MeshError::BuildNotFound(build_id))?;
            if !existing.is_finished() {
                return Err(MeshError::BuildNotFinished(existing.number));
            }

            let lock = self.submit_lock(existing.project_id, &existing.commit_hash);
            let guard = lock.clone().lock_owned().await;
            let reset = self
                .load_job(existing.project_id, &existing.commit_hash, &existing.job_name)
                .and_then(|_| {
                    self.update_build(build_id, |b| {
                        b.status = BuildStatus::Waiting;
                        b.submit_date = Utc::now();
                        b.pending_date = None;
                        b.running_date = None;
                        b.retry_date = None;
                        b.finish_date = None;
                        b.canceller = None;
                        b.agent = None;
                        b.paused = false;
                        b.job_workspace = None;
                        b.submitter = submitter;
                        b.submit_reason = reason.clone();
                    })
                });
            let build = match reset {
                Ok(build) => build,
                Err(e) => {
                    drop(guard);
                    self.release_submit_lock(existing.project_id, &existing.commit_hash, lock);
                    return Err(e);
                }
            };
            self.clean_build_dir(&build).await;
            tracing::info!(build_id = %build.id, reason = %build.submit_reason, "Build resubmitted");
            self.events.publish(BuildEvent::Submitted(build.clone()));
            drop(guard);
            self.release_submit_lock(existing.project_id, &existing.commit_hash, lock);

            for dependence in build.dependencies.iter().filter(|d| d.require_successful) {
                let Some(dependency) = self.builds.get(dependence.dependency) else {
                    continue;
                };
                if dependency.is_finished() && !dependency.is_successful() {
                    self.resubmit_boxed(
                        dependency.id,
                        format!("Resubmitted by build #{}", build.number),
                        submitter,
                    )
                    .await?;
                }
            }
            Ok(build)
        })
    }

    /// Submits jobs triggered by a branch or tag moving to `commit`. A
    /// deleted ref (`None`) triggers nothing.
    pub async fn on_ref_updated(
        &self,
        project_id: ProjectId,
        ref_name: &str,
        commit: Option<&str>,
    ) -> Result<Vec<Build>> {
        let project = self
            .projects
            .project(project_id)
            .ok_or_else(|| MeshError::ProjectNotFound(project_id.to_string()))?;
        let branch = ref_to_branch(ref_name);
        if branch.is_some() && branch == project.default_branch.as_deref() {
            self.schedule(project_id);
        }
        let Some(commit) = commit else {
            return Ok(Vec::new());
        };
        let Some(spec) = self.projects.build_spec(project_id, commit) else {
            return Ok(Vec::new());
        };
        if let Err(message) = spec.validate() {
            tracing::warn!(project = %project.path, commit, error = %message, "Ignoring invalid build spec");
            return Ok(Vec::new());
        }

        let tag = ref_to_tag(ref_name);
        let pipeline = new_pipeline();
        let mut submitted = Vec::new();
        for job in &spec.jobs {
            for trigger in &job.triggers {
                let reason = match (&trigger.kind, branch, tag) {
                    (TriggerKind::BranchUpdate { branches }, Some(branch), _)
                        if branches.as_deref().map_or(true, |p| matches_patterns(p, branch)) =>
                    {
                        format!("Branch '{}' is updated", branch)
                    }
                    (TriggerKind::TagCreate { tags }, _, Some(tag))
                        if tags.as_deref().map_or(true, |p| matches_patterns(p, tag)) =>
                    {
                        format!("Tag '{}' is created", tag)
                    }
                    _ => continue,
                };
                for params in matrix::expand(&trigger_matrix(&trigger.params)) {
                    let request = SubmitRequest::new(project_id, commit, job.name.clone(), ref_name)
                        .with_params(params)
                        .with_pipeline(pipeline.clone())
                        .with_reason(reason.clone());
                    match self.submit(request).await {
                        Ok(build) => submitted.push(build),
                        Err(e) => tracing::warn!(
                            project = %project.path,
                            job = %job.name,
                            error = %e,
                            "Failed to submit triggered job"
                        ),
                    }
                }
            }
        }
        Ok(submitted)
    }

    /// Submits jobs triggered by a pull request now at `commit`.
    pub async fn on_pull_request_updated(&self, request_id: RequestId, commit: &str) -> Result<Vec<Build>> {
        let request = self
            .projects
            .pull_request(request_id)
            .ok_or_else(|| MeshError::Explicit(format!("Pull request not found: {}", request_id)))?;
        let project_id = request.target_project;
        let Some(spec) = self.projects.build_spec(project_id, commit) else {
            return Ok(Vec::new());
        };
        if let Err(message) = spec.validate() {
            tracing::warn!(request = %request_id, commit, error = %message, "Ignoring invalid build spec");
            return Ok(Vec::new());
        }

        let ref_name = pull_request_ref(request_id);
        let pipeline = new_pipeline();
        let mut submitted = Vec::new();
        for job in &spec.jobs {
            for trigger in &job.triggers {
                let TriggerKind::PullRequest { branches } = &trigger.kind else {
                    continue;
                };
                if !branches
                    .as_deref()
                    .map_or(true, |p| matches_patterns(p, &request.target_branch))
                {
                    continue;
                }
                for params in matrix::expand(&trigger_matrix(&trigger.params)) {
                    let mut submit = SubmitRequest::new(project_id, commit, job.name.clone(), ref_name.clone())
                        .with_params(params)
                        .with_pipeline(pipeline.clone())
                        .with_request(request_id)
                        .with_reason(format!("Pull request #{} is updated", request_id));
                    submit.submitter = request.submitter;
                    match self.submit(submit).await {
                        Ok(build) => submitted.push(build),
                        Err(e) => tracing::warn!(
                            request = %request_id,
                            job = %job.name,
                            error = %e,
                            "Failed to submit triggered job"
                        ),
                    }
                }
            }
        }
        Ok(submitted)
    }
}

pub fn pull_request_ref(request_id: RequestId) -> String {
    format!("refs/pull/{}/merge", request_id)
}
