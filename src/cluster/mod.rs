//! Cluster membership and node-to-node dispatch.
//!
//! Work crossing node boundaries is expressed as a serializable
//! [`ClusterTask`]. A [`ClusterCoordinator`] routes tasks to the node that
//! must run them, where the registered [`TaskHandler`] (the node's job
//! manager) executes them.
//!
//! - [`local`]: in-process coordinator for single process deployments and tests
//! - [`shared`]: cluster-shared maps and the cluster-wide lock
//! - [`dispatch`]: submit/await helpers with cancellation
//!
//! The gRPC coordinator lives in [`crate::grpc`].

pub mod dispatch;
pub mod local;
pub mod shared;

use std::collections::BTreeMap;
use std::sync::Weak;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cache::{CacheAllocationRequest, CacheInstance};
use crate::error::Result;
use crate::logs::LogLine;
use crate::model::{BuildId, NodeId, ProjectId, UserId};

pub use dispatch::{Dispatcher, RemoteCall};
pub use local::{LocalCluster, LocalNetwork};
pub use shared::{
    ClusterLock, HostedSharedStore, MemorySharedStore, SharedMap, SharedOp, SharedReply, SharedStore,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum ClusterTask {
    /// Reconcile unfinished builds whose project is stored on the receiver.
    ReconcileBuilds { builds: Vec<BuildId> },
    CancelBuild {
        build_id: BuildId,
        canceller: Option<UserId>,
    },
    ResumeJob { job_token: String },
    CleanBuildDir {
        project_id: ProjectId,
        build_number: u64,
    },
    /// Runs on the leader.
    AllocateCaches {
        job_token: String,
        request: CacheAllocationRequest,
    },
    OpenShell {
        job_token: String,
        session_id: String,
        origin: NodeId,
    },
    ShellInput { session_id: String, input: String },
    ShellResize {
        session_id: String,
        rows: u16,
        cols: u16,
    },
    ShellExit { session_id: String },
    /// Shell output travelling back to the node owning the terminal.
    TerminalOutput {
        session_id: String,
        output: String,
        closed: bool,
    },
    AppendLog { build_id: BuildId, line: LogLine },
    RunServerStep {
        job_token: String,
        position: Vec<usize>,
        files: BTreeMap<String, Vec<u8>>,
        placeholders: BTreeMap<String, String>,
        call_by_agent: bool,
    },
    /// Operation on the cluster-shared store, run on its host node.
    Shared(SharedOp),
    Ping,
}

impl ClusterTask {
    pub fn name(&self) -> &'static str {
        match self {
            ClusterTask::ReconcileBuilds { .. } => "reconcile_builds",
            ClusterTask::CancelBuild { .. } => "cancel_build",
            ClusterTask::ResumeJob { .. } => "resume_job",
            ClusterTask::CleanBuildDir { .. } => "clean_build_dir",
            ClusterTask::AllocateCaches { .. } => "allocate_caches",
            ClusterTask::OpenShell { .. } => "open_shell",
            ClusterTask::ShellInput { .. } => "shell_input",
            ClusterTask::ShellResize { .. } => "shell_resize",
            ClusterTask::ShellExit { .. } => "shell_exit",
            ClusterTask::TerminalOutput { .. } => "terminal_output",
            ClusterTask::AppendLog { .. } => "append_log",
            ClusterTask::RunServerStep { .. } => "run_server_step",
            ClusterTask::Shared(_) => "shared",
            ClusterTask::Ping => "ping",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "output", content = "value", rename_all = "snake_case")]
pub enum TaskOutput {
    Done,
    Caches(Vec<(CacheInstance, Option<String>)>),
    Files(BTreeMap<String, Vec<u8>>),
    Shared(SharedReply),
}

/// Executes tasks addressed to the local node.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, origin: NodeId, task: ClusterTask) -> Result<TaskOutput>;
}

#[async_trait]
pub trait ClusterCoordinator: Send + Sync {
    fn local_node(&self) -> NodeId;

    fn leader(&self) -> Option<NodeId>;

    fn is_leader(&self) -> bool {
        self.leader() == Some(self.local_node())
    }

    fn nodes(&self) -> Vec<NodeId>;

    /// Registers the handler for tasks addressed to this node. Held weakly so
    /// the coordinator never keeps the job manager alive.
    fn register_handler(&self, handler: Weak<dyn TaskHandler>);

    /// Runs `task` on `node` and waits for its output.
    async fn call(&self, node: NodeId, task: ClusterTask) -> Result<TaskOutput>;
}
