use std::collections::HashMap;
use std::sync::atomic::Ordering;

use chrono::Utc;

use crate::cluster::ClusterTask;
use crate::events::BuildEvent;
use crate::model::{Build, BuildId, BuildStatus, NodeId};
use crate::node::JobManager;
use crate::worker::execution::ExecutionOutcome;

const DEPENDENCY_FAILED: &str = "Some dependencies are required to be successful but failed";

impl JobManager {
    /// Periodic loop driving builds through their lifecycle. Keeps running
    /// after [`JobManager::stop`] until every local execution is resolved.
    pub(crate) async fn reconcile_loop(&self) {
        let mut interval = tokio::time::interval(self.config.reconcile_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let running = self.running.load(Ordering::SeqCst);
            if !running && self.executions.lock().is_empty() {
                break;
            }
            if running && self.coordinator.is_leader() {
                self.reconcile_cluster().await;
            }
            self.reconcile_local().await;
        }
        self.triggers.unschedule_all();
        self.scheduled.lock().clear();
        tracing::info!(node_id = %self.local_node(), "Reconciliation loop stopped");
    }

    /// Leader pass: hands unfinished builds to the nodes storing their
    /// projects.
    async fn reconcile_cluster(&self) {
        let mut by_node: HashMap<NodeId, Vec<BuildId>> = HashMap::new();
        for (build_id, project_id) in self.builds.query_unfinished() {
            match self.projects.storage_node(project_id) {
                Some(node) => by_node.entry(node).or_default().push(build_id),
                None => tracing::warn!(
                    build_id = %build_id,
                    project_id = %project_id,
                    "No storage node for project of unfinished build"
                ),
            }
        }

        let calls: Vec<_> = by_node
            .into_iter()
            .map(|(node, builds)| {
                self.dispatcher
                    .submit_to_node(node, ClusterTask::ReconcileBuilds { builds })
            })
            .collect();
        for call in calls {
            let node = call.node();
            if let Err(e) = call.wait().await {
                tracing::error!(node = %node, error = %e, "Error reconciling builds on node");
            }
        }
    }

    /// Node pass over builds of projects stored here.
    pub(crate) async fn reconcile_builds(&self, build_ids: &[BuildId]) {
        let started = *self.started.borrow();
        for &build_id in build_ids {
            let Some(build) = self.builds.get(build_id) else {
                continue;
            };
            match build.status {
                BuildStatus::Running | BuildStatus::Pending => {
                    let has_execution = {
                        let executions = self.executions.lock();
                        match executions.get(&build_id) {
                            Some(execution) => {
                                if execution.is_timed_out() {
                                    tracing::info!(build_id = %build_id, "Job timed out");
                                    execution.time_out();
                                }
                                true
                            }
                            None => false,
                        }
                    };
                    if !has_execution && started && self.is_running() {
                        self.start_execution(build_id).await;
                    }
                }
                BuildStatus::Waiting => self.reconcile_waiting(&build),
                _ => {}
            }
        }
    }

    fn reconcile_waiting(&self, build: &Build) {
        if self.executions.lock().contains_key(&build.id) {
            // Backing off between attempts
            return;
        }
        if build.retry_date.is_some() {
            if self.is_running() {
                self.promote(build.id);
            }
            return;
        }

        let mut all_finished = true;
        for dependence in &build.dependencies {
            let Some(dependency) = self.builds.get(dependence.dependency) else {
                continue;
            };
            if !dependency.is_finished() {
                all_finished = false;
            } else if dependence.require_successful && !dependency.is_successful() {
                self.fail_waiting(build.id);
                return;
            }
        }
        if all_finished {
            self.promote(build.id);
        }
    }

    fn promote(&self, build_id: BuildId) {
        let mut promoted = false;
        match self.update_build(build_id, |b| {
            if b.status == BuildStatus::Waiting {
                b.mark_pending();
                promoted = true;
            }
        }) {
            Ok(build) if promoted => {
                tracing::debug!(build_id = %build_id, "Build pending");
                self.events.publish(BuildEvent::Pending(build));
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(build_id = %build_id, error = %e, "Failed to promote build"),
        }
    }

    fn fail_waiting(&self, build_id: BuildId) {
        let mut failed = false;
        match self.update_build(build_id, |b| {
            if b.status == BuildStatus::Waiting {
                b.finish(BuildStatus::Failed);
                failed = true;
            }
        }) {
            Ok(build) if failed => {
                self.logs.append(
                    build_id,
                    crate::logs::LogLine {
                        level: crate::logs::LogLevel::Error,
                        message: DEPENDENCY_FAILED.to_string(),
                    },
                );
                tracing::info!(build_id = %build_id, "{}", DEPENDENCY_FAILED);
                self.publish_finished(build);
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(build_id = %build_id, error = %e, "Failed to fail build"),
        }
    }

    async fn start_execution(&self, build_id: BuildId) {
        let build = match self.update_build(build_id, |b| {
            if b.status != BuildStatus::Pending {
                b.mark_pending();
            }
        }) {
            Ok(build) => build,
            Err(e) => {
                tracing::warn!(build_id = %build_id, error = %e, "Failed to prepare build execution");
                return;
            }
        };
        match self.execute(&build).await {
            Ok(execution) => {
                self.executions.lock().insert(build_id, execution);
            }
            Err(e) => {
                let message = if e.is_explicit() {
                    e.to_string()
                } else {
                    tracing::error!(build_id = %build_id, error = %e, "Error starting job");
                    "Error running job".to_string()
                };
                self.logs.append(
                    build_id,
                    crate::logs::LogLine {
                        level: crate::logs::LogLevel::Error,
                        message,
                    },
                );
                match self.update_build(build_id, |b| {
                    if !b.is_finished() {
                        b.finish(BuildStatus::Failed);
                    }
                }) {
                    Ok(build) => self.publish_finished(build),
                    Err(e) => tracing::warn!(build_id = %build_id, error = %e, "Failed to fail build"),
                }
            }
        }
    }

    /// Resolves local executions that are done or whose build went away.
    async fn reconcile_local(&self) {
        let mut finished = Vec::new();
        {
            let mut executions = self.executions.lock();
            let ids: Vec<BuildId> = executions.keys().copied().collect();
            for build_id in ids {
                let build = self.builds.get(build_id);
                let obsolete = build.as_ref().map_or(true, Build::is_finished);
                if obsolete {
                    if let Some(execution) = executions.remove(&build_id) {
                        tracing::debug!(build_id = %build_id, "Dropping execution of finished build");
                        execution.cancel(None);
                    }
                    continue;
                }
                if executions.get(&build_id).map_or(false, |e| e.is_done()) {
                    if let Some(execution) = executions.remove(&build_id) {
                        finished.push((build_id, execution));
                    }
                }
            }
        }

        for (build_id, execution) in finished {
            let logger = execution.logger().clone();
            let (status, canceller) = match execution.outcome().await {
                ExecutionOutcome::Successful => {
                    logger.log("Job finished");
                    (BuildStatus::Successful, None)
                }
                ExecutionOutcome::TimedOut => {
                    logger.error("Job timed out");
                    (BuildStatus::TimedOut, None)
                }
                ExecutionOutcome::Cancelled(canceller) => {
                    logger.warning("Job cancelled");
                    (BuildStatus::Cancelled, canceller)
                }
                ExecutionOutcome::Failed(e) => {
                    if e.is_expected_failure() {
                        // Cause already logged by the executor
                    } else if e.is_explicit() {
                        logger.error(e.to_string());
                    } else {
                        logger.error("Error running job");
                        tracing::error!(build_id = %build_id, error = %e, "Error running job");
                    }
                    (BuildStatus::Failed, None)
                }
            };
            match self.update_build(build_id, |b| {
                if !b.is_finished() {
                    b.finish(status);
                    b.canceller = canceller;
                    b.paused = false;
                }
            }) {
                Ok(build) => {
                    tracing::info!(
                        build_id = %build_id,
                        status = %build.status,
                        duration_ms = build
                            .running_date
                            .map(|d| (Utc::now() - d).num_milliseconds())
                            .unwrap_or_default(),
                        "Build finished"
                    );
                    self.publish_finished(build);
                }
                Err(e) => tracing::warn!(build_id = %build_id, error = %e, "Failed to finish build"),
            }
        }
    }
}
