use thiserror::Error;

use crate::model::{BuildId, NodeId, UserId};

#[derive(Error, Debug)]
pub enum MeshError {
    #[error("Build spec not defined (project: {project}, commit: {commit})")]
    SpecNotFound { project: String, commit: String },

    #[error("Error validating build spec (project: {project}, commit: {commit}, message: {message})")]
    SpecInvalid {
        project: String,
        commit: String,
        message: String,
    },

    #[error("Job not found (project: {project}, commit: {commit}, job: {job})")]
    JobNotFound {
        project: String,
        commit: String,
        job: String,
    },

    #[error("Invalid job parameters: {0}")]
    ParamInvalid(String),

    #[error("{0}")]
    PermissionDenied(String),

    #[error("Unable to find specified job executor '{0}'")]
    ExecutorNotFound(String),

    #[error("Specified job executor '{0}' is disabled")]
    ExecutorDisabled(String),

    #[error("Specified job executor '{0}' is not authorized for current job")]
    ExecutorUnauthorized(String),

    #[error("{0}")]
    NoExecutorAvailable(String),

    #[error("Job shell not ready")]
    ShellNotReady,

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Job failure whose cause has already been written to the job log.
    /// Eligible for retry.
    #[error("{0}")]
    JobFailed(String),

    /// Job failure that must not be retried.
    #[error("{0}")]
    JobAborted(String),

    #[error("Job timed out")]
    Timeout,

    #[error("Job cancelled")]
    Cancelled { canceller: Option<UserId> },

    #[error("Build not found: {0}")]
    BuildNotFound(BuildId),

    #[error("Build #{0} not finished yet")]
    BuildNotFinished(u64),

    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    #[error("No job context found for specified job token")]
    JobContextNotFound,

    #[error("Node {0} is not available")]
    NodeUnavailable(NodeId),

    #[error("Remote error from node {node}: {message}")]
    Remote { node: NodeId, message: String },

    #[error("{0}")]
    Explicit(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("gRPC error: {0}")]
    GrpcError(#[from] tonic::Status),

    #[error("Transport error: {0}")]
    TransportError(#[from] tonic::transport::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MeshError {
    /// Errors with a message meant for the user. Anything else is logged
    /// generically so internals do not leak into job logs.
    pub fn is_explicit(&self) -> bool {
        !matches!(
            self,
            MeshError::Io(_)
                | MeshError::Serialization(_)
                | MeshError::GrpcError(_)
                | MeshError::TransportError(_)
                | MeshError::Internal(_)
        )
    }

    /// Failures already reported to the job log by whoever raised them.
    pub fn is_expected_failure(&self) -> bool {
        matches!(self, MeshError::JobFailed(_))
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, MeshError::Cancelled { .. })
    }
}

pub type Result<T> = std::result::Result<T, MeshError>;
