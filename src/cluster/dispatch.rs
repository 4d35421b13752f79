use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cluster::{ClusterCoordinator, ClusterTask, TaskOutput};
use crate::error::{MeshError, Result};
use crate::logs::{LogLine, LogSink};
use crate::model::{BuildId, NodeId, ProjectId};
use crate::store::ProjectStore;

/// Handle to a task submitted to a node.
pub struct RemoteCall {
    node: NodeId,
    handle: JoinHandle<Result<TaskOutput>>,
}

impl RemoteCall {
    pub fn node(&self) -> NodeId {
        self.node
    }

    pub async fn wait(self) -> Result<TaskOutput> {
        self.handle
            .await
            .map_err(|e| MeshError::Internal(format!("remote call to node {} failed: {}", self.node, e)))?
    }

    /// Waits for the output, aborting the outstanding request when `cancel`
    /// fires first.
    pub async fn wait_or_cancel(mut self, cancel: &CancellationToken) -> Result<TaskOutput> {
        tokio::select! {
            joined = &mut self.handle => joined
                .map_err(|e| MeshError::Internal(format!("remote call to node {} failed: {}", self.node, e)))?,
            _ = cancel.cancelled() => {
                self.handle.abort();
                tracing::debug!(node = %self.node, "Remote call cancelled");
                Err(MeshError::Cancelled { canceller: None })
            }
        }
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

/// Routes cluster tasks to explicit nodes or to the node storing a project.
#[derive(Clone)]
pub struct Dispatcher {
    coordinator: Arc<dyn ClusterCoordinator>,
    projects: Arc<dyn ProjectStore>,
}

impl Dispatcher {
    pub fn new(coordinator: Arc<dyn ClusterCoordinator>, projects: Arc<dyn ProjectStore>) -> Self {
        Self {
            coordinator,
            projects,
        }
    }

    pub fn coordinator(&self) -> &Arc<dyn ClusterCoordinator> {
        &self.coordinator
    }

    pub fn project_node(&self, project_id: ProjectId) -> Result<NodeId> {
        self.projects
            .storage_node(project_id)
            .ok_or_else(|| MeshError::ProjectNotFound(project_id.to_string()))
    }

    pub fn submit_to_node(&self, node: NodeId, task: ClusterTask) -> RemoteCall {
        let coordinator = self.coordinator.clone();
        let handle = tokio::spawn(async move { coordinator.call(node, task).await });
        RemoteCall { node, handle }
    }

    pub fn submit_to_project_node(&self, project_id: ProjectId, task: ClusterTask) -> Result<RemoteCall> {
        let node = self.project_node(project_id)?;
        Ok(self.submit_to_node(node, task))
    }

    pub async fn run_on_node(
        &self,
        node: NodeId,
        task: ClusterTask,
        cancel: &CancellationToken,
    ) -> Result<TaskOutput> {
        self.submit_to_node(node, task).wait_or_cancel(cancel).await
    }

    pub async fn run_on_project_node(
        &self,
        project_id: ProjectId,
        task: ClusterTask,
        cancel: &CancellationToken,
    ) -> Result<TaskOutput> {
        self.submit_to_project_node(project_id, task)?
            .wait_or_cancel(cancel)
            .await
    }

    pub async fn run_on_leader(&self, task: ClusterTask, cancel: &CancellationToken) -> Result<TaskOutput> {
        let leader = self
            .coordinator
            .leader()
            .ok_or_else(|| MeshError::Internal("no cluster leader".to_string()))?;
        self.run_on_node(leader, task, cancel).await
    }
}

/// Sends job log lines to the node storing the project, preserving order.
pub struct RemoteLogSink {
    tx: mpsc::UnboundedSender<(BuildId, LogLine)>,
}

impl RemoteLogSink {
    pub fn new(dispatcher: Dispatcher, project_id: ProjectId) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<(BuildId, LogLine)>();
        tokio::spawn(async move {
            while let Some((build_id, line)) = rx.recv().await {
                let call = match dispatcher
                    .submit_to_project_node(project_id, ClusterTask::AppendLog { build_id, line })
                {
                    Ok(call) => call,
                    Err(e) => {
                        tracing::warn!(build_id = %build_id, error = %e, "Unable to forward job log");
                        continue;
                    }
                };
                if let Err(e) = call.wait().await {
                    tracing::warn!(build_id = %build_id, error = %e, "Unable to forward job log");
                }
            }
        });
        Self { tx }
    }
}

impl LogSink for RemoteLogSink {
    fn append(&self, build_id: BuildId, line: LogLine) {
        // Forwarder only stops with the runtime
        let _ = self.tx.send((build_id, line));
    }
}
