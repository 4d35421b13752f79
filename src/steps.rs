//! Steps executed on the node holding the project's storage rather than
//! inside the executor.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{MeshError, Result};
use crate::logs::JobLogger;
use crate::model::{spec::matches_patterns, BuildId, ProjectId};
use crate::store::FsArtifactStore;

pub const PUBLISH_ARTIFACTS: &str = "publish_artifacts";

/// One server step invocation with the files the agent uploaded.
#[derive(Debug)]
pub struct ServerStep {
    pub project_id: ProjectId,
    pub build_id: BuildId,
    pub build_number: u64,
    pub step_type: String,
    pub properties: BTreeMap<String, String>,
    pub input_files: BTreeMap<String, Vec<u8>>,
    pub logger: Option<JobLogger>,
}

#[async_trait]
pub trait ServerStepRunner: Send + Sync {
    /// Runs the step and returns files to be written back to the job
    /// workspace. Implementations should stop early once `cancel` fires.
    async fn run(&self, step: ServerStep, cancel: CancellationToken) -> Result<BTreeMap<String, Vec<u8>>>;
}

/// Handles `publish_artifacts` steps by storing uploaded files matching the
/// `files` property as build artifacts.
#[derive(Debug, Clone)]
pub struct ArtifactPublisher {
    artifacts: Arc<FsArtifactStore>,
}

impl ArtifactPublisher {
    pub fn new(artifacts: Arc<FsArtifactStore>) -> Self {
        Self { artifacts }
    }
}

#[async_trait]
impl ServerStepRunner for ArtifactPublisher {
    async fn run(&self, step: ServerStep, cancel: CancellationToken) -> Result<BTreeMap<String, Vec<u8>>> {
        if step.step_type != PUBLISH_ARTIFACTS {
            return Err(MeshError::Explicit(format!(
                "Unsupported server step type: {}",
                step.step_type
            )));
        }
        if cancel.is_cancelled() {
            return Err(MeshError::Cancelled { canceller: None });
        }
        let patterns = step
            .properties
            .get("files")
            .map(String::as_str)
            .unwrap_or("**");
        let selected: BTreeMap<String, Vec<u8>> = step
            .input_files
            .into_iter()
            .filter(|(path, _)| matches_patterns(patterns, path))
            .collect();
        let published = self
            .artifacts
            .publish(step.project_id, step.build_number, &selected)?;
        if let Some(logger) = &step.logger {
            logger.log(format!("Published {} artifact(s)", published));
        }
        tracing::debug!(build_id = %step.build_id, published, "Published artifacts");
        Ok(BTreeMap::new())
    }
}
