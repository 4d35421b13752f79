//! Persistence collaborators consumed by the job core.
//!
//! Builds, projects and artifacts are owned elsewhere; this module defines the
//! narrow interfaces the scheduler needs plus in-memory implementations used
//! for single-process deployments and tests.

pub mod artifacts;
pub mod memory;

use std::path::Path;

use crate::error::Result;
use crate::model::{
    Build, BuildId, BuildKey, BuildSelector, BuildSpec, NodeId, ParamMap, Project, ProjectId,
    PullRequest, RequestId,
};

pub use artifacts::FsArtifactStore;
pub use memory::{MemoryBuildStore, MemoryProjectStore};

pub trait BuildStore: Send + Sync {
    /// Persists a new build, assigning its id and per-project number.
    fn create(&self, build: Build) -> Build;

    fn get(&self, id: BuildId) -> Option<Build>;

    fn update(&self, build: &Build) -> Result<()>;

    /// Removes a build created by a submission that failed part way.
    fn delete(&self, id: BuildId);

    /// Applies `change` to the stored build atomically and returns the result.
    fn modify(&self, id: BuildId, change: &mut dyn FnMut(&mut Build)) -> Result<Build>;

    /// A build with the same key that is either in `pipeline` or unfinished.
    fn find_equivalent(&self, key: &BuildKey, pipeline: &str) -> Option<Build>;

    /// Every unfinished build with the project owning it.
    fn query_unfinished(&self) -> Vec<(BuildId, ProjectId)>;

    /// Unfinished builds of a job on a ref, with the given non-secret params.
    fn query_unfinished_matching(
        &self,
        project_id: ProjectId,
        job_name: &str,
        ref_name: &str,
        request: Option<RequestId>,
        params: &ParamMap,
    ) -> Vec<Build>;

    fn find_by_selector(&self, project_id: ProjectId, selector: &BuildSelector) -> Option<Build>;
}

pub trait ProjectStore: Send + Sync {
    fn project(&self, id: ProjectId) -> Option<Project>;

    fn find_by_path(&self, path: &str) -> Option<Project>;

    /// Parsed build spec at a commit, `None` when the commit has none.
    fn build_spec(&self, project_id: ProjectId, commit: &str) -> Option<BuildSpec>;

    fn resolve_ref(&self, project_id: ProjectId, ref_name: &str) -> Option<String>;

    /// Whether `base` is an ancestor of (or equal to) `tip`.
    fn is_merged_into(&self, project_id: ProjectId, base: &str, tip: &str) -> bool;

    /// Node holding the authoritative storage of the project.
    fn storage_node(&self, project_id: ProjectId) -> Option<NodeId>;

    fn projects(&self) -> Vec<ProjectId>;

    fn pull_request(&self, id: RequestId) -> Option<PullRequest>;
}

pub trait ArtifactStore: Send + Sync {
    /// Clears the storage directory of a (re)submitted build.
    fn clean_build_dir(&self, project_id: ProjectId, build_number: u64) -> Result<()>;

    /// Copies artifacts of `build` matching `patterns` into `target`,
    /// returning the number of files copied.
    fn copy_artifacts(&self, build: &Build, patterns: &str, target: &Path) -> Result<usize>;
}
