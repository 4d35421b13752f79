//! Reactions to finished builds: post-build actions of the finished job and
//! jobs triggered by a finished dependency. Both submit into the pipeline of
//! the finished build.

use crate::error::{MeshError, Result};
use crate::model::{Build, BuildSpec, BuildStatus, PostBuildActionKind, TriggerKind};
use crate::node::JobManager;
use crate::scheduler::matrix;
use crate::scheduler::submit::{trigger_matrix, SubmitRequest};
use crate::worker::interpolate::InterpolationContext;

impl JobManager {
    /// Runs after every finished build. Errors are logged, never returned.
    pub async fn on_build_finished(&self, build: Build) {
        if let Err(e) = self.run_post_build_actions(&build).await {
            tracing::error!(
                project_id = %build.project_id,
                commit = %build.commit_hash,
                job = %build.job_name,
                error = %e,
                "Error processing post build actions"
            );
        }
        if let Err(e) = self.on_dependency_finished(&build).await {
            tracing::warn!(build_id = %build.id, error = %e, "Failed to trigger dependent jobs");
        }
    }

    fn finished_build_spec(&self, build: &Build) -> Option<BuildSpec> {
        let spec = self.projects.build_spec(build.project_id, &build.commit_hash)?;
        match spec.validate() {
            Ok(()) => Some(spec),
            Err(message) => {
                tracing::warn!(build_id = %build.id, error = %message, "Ignoring invalid build spec");
                None
            }
        }
    }

    /// Submits the jobs named by the post-build actions whose condition holds
    /// for `build`. Stops at the first action that fails.
    pub async fn run_post_build_actions(&self, build: &Build) -> Result<Vec<Build>> {
        let Some(spec) = self.finished_build_spec(build) else {
            return Ok(Vec::new());
        };
        let Some(job) = spec.job(&build.job_name) else {
            return Ok(Vec::new());
        };
        let project = self
            .projects
            .project(build.project_id)
            .ok_or_else(|| MeshError::ProjectNotFound(build.project_id.to_string()))?;

        let mut submitted = Vec::new();
        for action in &job.post_build_actions {
            if !action.condition.matches(build) {
                continue;
            }
            let PostBuildActionKind::RunJob { job_name, params } = &action.kind;
            let (job_name, supplies) = {
                let mut context = InterpolationContext::new(&project.path, build, self.secrets.as_ref());
                (context.interpolate(job_name)?, context.interpolate_supplies(params)?)
            };
            for cell in matrix::expand(&supplies) {
                let request = SubmitRequest {
                    project_id: build.project_id,
                    commit_hash: build.commit_hash.clone(),
                    job_name: job_name.clone(),
                    params: cell,
                    pipeline: build.pipeline.clone(),
                    ref_name: build.ref_name.clone(),
                    submitter: build.submitter,
                    request: build.request,
                    reason: format!("Post build action of job '{}'", build.job_name),
                };
                submitted.push(self.submit(request).await?);
            }
        }
        Ok(submitted)
    }

    /// Submits jobs depending on the job of `finished` that carry a
    /// dependency-finished trigger. A dependency requiring success only
    /// fires for a successful build.
    pub async fn on_dependency_finished(&self, finished: &Build) -> Result<Vec<Build>> {
        let Some(spec) = self.finished_build_spec(finished) else {
            return Ok(Vec::new());
        };

        let mut submitted = Vec::new();
        for job in &spec.jobs {
            let Some(dependency) = job
                .job_dependencies
                .iter()
                .find(|d| d.job_name == finished.job_name)
            else {
                continue;
            };
            if dependency.require_successful && finished.status != BuildStatus::Successful {
                continue;
            }
            for trigger in &job.triggers {
                if !matches!(trigger.kind, TriggerKind::DependencyFinished) {
                    continue;
                }
                for params in matrix::expand(&trigger_matrix(&trigger.params)) {
                    let request = SubmitRequest {
                        project_id: finished.project_id,
                        commit_hash: finished.commit_hash.clone(),
                        job_name: job.name.clone(),
                        params,
                        pipeline: finished.pipeline.clone(),
                        ref_name: finished.ref_name.clone(),
                        submitter: finished.submitter,
                        request: finished.request,
                        reason: format!("Dependency job '{}' is finished", finished.job_name),
                    };
                    match self.submit(request).await {
                        Ok(build) => submitted.push(build),
                        Err(e) => tracing::warn!(
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
