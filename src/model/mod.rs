//! Domain records shared by every component.
//!
//! - [`build`]: the persistent [`Build`] record and its status machine
//! - [`spec`]: the declarative build spec a commit carries
//! - [`context`]: the cluster-visible [`JobContext`] of one running attempt

pub mod build;
pub mod context;
pub mod spec;

use serde::{Deserialize, Serialize};

pub use build::{Build, BuildDependence, BuildKey, BuildParam, BuildStatus};
pub use context::{Action, ActionKind, ExecutorSettings, JobContext};
pub use spec::{
    ActionCondition, BuildSelector, BuildSpec, CacheSpec, JobDependency, JobSpec, JobTrigger,
    ParamSpec, ParamSupply, ParamType, PostBuildAction, PostBuildActionKind, ProjectDependency,
    RetryCondition, Service, Step, StepKind, TriggerKind,
};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Identity of a persisted build.
    BuildId
);
id_type!(ProjectId);
id_type!(UserId);
id_type!(
    /// Cluster member identity.
    NodeId
);
id_type!(RequestId);

/// A project as seen by the job core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub path: String,
    pub default_branch: Option<String>,
}

/// A pull request a build can be triggered for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub id: RequestId,
    pub source_project: Option<ProjectId>,
    pub source_branch: Option<String>,
    pub target_project: ProjectId,
    pub target_branch: String,
    pub submitter: Option<UserId>,
}

/// Ordered parameter values keyed by name.
pub type ParamMap = std::collections::BTreeMap<String, Vec<String>>;

/// Each parameter maps to the alternative value lists it can take.
pub type ParamMatrix = std::collections::BTreeMap<String, Vec<Vec<String>>>;

pub const BRANCH_PREFIX: &str = "refs/heads/";
pub const TAG_PREFIX: &str = "refs/tags/";

/// Branch name of a ref, if it is a branch ref.
pub fn ref_to_branch(ref_name: &str) -> Option<&str> {
    ref_name.strip_prefix(BRANCH_PREFIX)
}

pub fn ref_to_tag(ref_name: &str) -> Option<&str> {
    ref_name.strip_prefix(TAG_PREFIX)
}

pub fn branch_to_ref(branch: &str) -> String {
    format!("{}{}", BRANCH_PREFIX, branch)
}
