use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use cron::Schedule;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::error::{MeshError, Result};
use crate::events::BuildEvent;
use crate::model::{branch_to_ref, ParamMatrix, ProjectId, TriggerKind};
use crate::node::JobManager;
use crate::scheduler::matrix;
use crate::scheduler::submit::{new_pipeline, trigger_matrix, SubmitRequest};

type Task = Arc<dyn Fn() + Send + Sync>;

/// Runs callbacks on cron schedules. Each scheduled task owns a tokio task
/// sleeping until the next fire time.
#[derive(Default)]
pub struct TaskScheduler {
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TaskScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `task` under `id`, replacing any task with the same id.
    pub fn schedule(&self, id: impl Into<String>, expression: &str, task: Task) -> Result<()> {
        let schedule = Schedule::from_str(expression)
            .map_err(|e| MeshError::Explicit(format!("Invalid cron expression '{}': {}", expression, e)))?;
        let id = id.into();
        let task_id = id.clone();
        let handle = tokio::spawn(async move {
            let mut last: DateTime<Utc> = Utc::now();
            loop {
                let now = Utc::now();
                let from = if now > last { now } else { last };
                let Some(next) = schedule.after(&from).next() else {
                    tracing::debug!(task_id = %task_id, "Cron schedule exhausted");
                    return;
                };
                let wait = (next - Utc::now()).to_std().unwrap_or_default();
                tokio::time::sleep(wait).await;
                last = next;
                tracing::debug!(task_id = %task_id, "Cron task fired");
                task();
            }
        });
        if let Some(previous) = self.tasks.lock().insert(id, handle) {
            previous.abort();
        }
        Ok(())
    }

    pub fn unschedule(&self, id: &str) {
        if let Some(handle) = self.tasks.lock().remove(id) {
            handle.abort();
        }
    }

    pub fn unschedule_all(&self) {
        for (_, handle) in self.tasks.lock().drain() {
            handle.abort();
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.unschedule_all();
    }
}

impl JobManager {
    /// Registers the schedule triggers of the project's default branch head,
    /// replacing whatever was registered for the project before.
    pub fn schedule(&self, project_id: ProjectId) {
        self.unschedule(project_id);

        let Some(project) = self.projects.project(project_id) else {
            return;
        };
        let Some(branch) = project.default_branch.clone() else {
            return;
        };
        let ref_name = branch_to_ref(&branch);
        let Some(commit) = self.projects.resolve_ref(project_id, &ref_name) else {
            return;
        };
        let Some(spec) = self.projects.build_spec(project_id, &commit) else {
            return;
        };
        if let Err(message) = spec.validate() {
            tracing::warn!(
                project = %project.path,
                commit = %commit,
                error = %message,
                "Not scheduling jobs of invalid build spec"
            );
            return;
        }

        let mut ids = Vec::new();
        for job in &spec.jobs {
            for (index, trigger) in job.triggers.iter().enumerate() {
                let TriggerKind::Schedule { cron_expression } = &trigger.kind else {
                    continue;
                };
                let id = format!("{}:{}:{}", project_id, job.name, index);
                let fire = ScheduledJob {
                    manager: self.this.clone(),
                    project_id,
                    commit: commit.clone(),
                    ref_name: ref_name.clone(),
                    job_name: job.name.clone(),
                    matrix: trigger_matrix(&trigger.params),
                };
                let task: Task = Arc::new(move || fire.fire());
                match self.triggers.schedule(id.clone(), cron_expression, task) {
                    Ok(()) => ids.push(id),
                    Err(e) => tracing::warn!(project = %project.path, job = %job.name, error = %e, "Failed to schedule job"),
                }
            }
        }
        if !ids.is_empty() {
            tracing::info!(project = %project.path, tasks = ids.len(), "Scheduled cron triggers");
            self.scheduled.lock().insert(project_id, ids);
        }
    }

    pub fn unschedule(&self, project_id: ProjectId) {
        let ids = self.scheduled.lock().remove(&project_id);
        for id in ids.into_iter().flatten() {
            self.triggers.unschedule(&id);
        }
    }

    pub fn scheduled_tasks(&self, project_id: ProjectId) -> Vec<String> {
        self.scheduled
            .lock()
            .get(&project_id)
            .cloned()
            .unwrap_or_default()
    }
}

struct ScheduledJob {
    manager: Weak<JobManager>,
    project_id: ProjectId,
    commit: String,
    ref_name: String,
    job_name: String,
    matrix: ParamMatrix,
}

impl ScheduledJob {
    fn fire(&self) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        manager.events.publish(BuildEvent::ScheduleFired {
            project_id: self.project_id,
            job_name: self.job_name.clone(),
        });
        let pipeline = new_pipeline();
        let requests: Vec<SubmitRequest> = matrix::expand(&self.matrix)
            .into_iter()
            .map(|params| {
                SubmitRequest::new(self.project_id, self.commit.clone(), self.job_name.clone(), self.ref_name.clone())
                    .with_params(params)
                    .with_pipeline(pipeline.clone())
                    .with_reason("Scheduled")
            })
            .collect();
        tokio::spawn(async move {
            for request in requests {
                let job_name = request.job_name.clone();
                if let Err(e) = manager.submit(request).await {
                    tracing::warn!(job = %job_name, error = %e, "Failed to submit scheduled job");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn invalid_expression_is_rejected() {
        let scheduler = TaskScheduler::new();
        let err = scheduler
            .schedule("bad", "every day", Arc::new(|| {}))
            .unwrap_err();
        assert!(err.to_string().contains("Invalid cron expression"));
        assert!(scheduler.is_empty());
    }

    #[tokio::test]
    async fn fires_and_unschedules() {
        let scheduler = TaskScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        scheduler
            .schedule(
                "every-second",
                "* * * * * *",
                Arc::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        assert_eq!(scheduler.len(), 1);

        tokio::time::sleep(std::time::Duration::from_millis(2500)).await;
        assert!(fired.load(Ordering::SeqCst) >= 1);

        scheduler.unschedule("every-second");
        assert!(scheduler.is_empty());
        let seen = fired.load(Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn same_id_replaces_task() {
        let scheduler = TaskScheduler::new();
        scheduler.schedule("t", "0 0 * * * *", Arc::new(|| {})).unwrap();
        scheduler.schedule("t", "0 30 * * * *", Arc::new(|| {})).unwrap();
        assert_eq!(scheduler.len(), 1);
        scheduler.unschedule_all();
        assert!(scheduler.is_empty());
    }
}
