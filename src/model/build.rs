use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::spec::ParamType;
use crate::model::{BuildId, ParamMap, ProjectId, RequestId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Waiting,
    Pending,
    Running,
    Successful,
    Failed,
    TimedOut,
    Cancelled,
}

impl BuildStatus {
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            BuildStatus::Successful
                | BuildStatus::Failed
                | BuildStatus::TimedOut
                | BuildStatus::Cancelled
        )
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildStatus::Waiting => write!(f, "waiting"),
            BuildStatus::Pending => write!(f, "pending"),
            BuildStatus::Running => write!(f, "running"),
            BuildStatus::Successful => write!(f, "successful"),
            BuildStatus::Failed => write!(f, "failed"),
            BuildStatus::TimedOut => write!(f, "timed_out"),
            BuildStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Typed values of one build parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildParam {
    pub param_type: ParamType,
    pub values: Vec<String>,
}

/// Edge from a dependent build to one of its dependencies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildDependence {
    pub dependency: BuildId,
    pub require_successful: bool,
    pub artifacts: Option<String>,
    pub destination_path: Option<String>,
}

/// Uniqueness key of a build. Secret parameters never take part in it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BuildKey {
    pub project_id: ProjectId,
    pub commit_hash: String,
    pub job_name: String,
    pub ref_name: String,
    pub request: Option<RequestId>,
    pub params: ParamMap,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub id: BuildId,
    pub number: u64,
    pub project_id: ProjectId,
    pub commit_hash: String,
    pub job_name: String,
    pub ref_name: String,
    pub status: BuildStatus,
    pub submit_date: DateTime<Utc>,
    pub pending_date: Option<DateTime<Utc>>,
    pub running_date: Option<DateTime<Utc>>,
    pub retry_date: Option<DateTime<Utc>>,
    pub finish_date: Option<DateTime<Utc>>,
    pub submitter: Option<UserId>,
    pub canceller: Option<UserId>,
    pub submit_reason: String,
    pub agent: Option<String>,
    pub pipeline: String,
    pub request: Option<RequestId>,
    pub params: BTreeMap<String, BuildParam>,
    pub dependencies: Vec<BuildDependence>,
    pub paused: bool,
    pub job_workspace: Option<String>,
}

impl Build {
    /// A fresh WAITING build. Identity is assigned by the store on create.
    pub fn new(
        project_id: ProjectId,
        commit_hash: impl Into<String>,
        job_name: impl Into<String>,
        ref_name: impl Into<String>,
        pipeline: impl Into<String>,
    ) -> Self {
        Self {
            id: BuildId(0),
            number: 0,
            project_id,
            commit_hash: commit_hash.into(),
            job_name: job_name.into(),
            ref_name: ref_name.into(),
            status: BuildStatus::Waiting,
            submit_date: Utc::now(),
            pending_date: None,
            running_date: None,
            retry_date: None,
            finish_date: None,
            submitter: None,
            canceller: None,
            submit_reason: String::new(),
            agent: None,
            pipeline: pipeline.into(),
            request: None,
            params: BTreeMap::new(),
            dependencies: Vec::new(),
            paused: false,
            job_workspace: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_finished()
    }

    pub fn is_successful(&self) -> bool {
        self.status == BuildStatus::Successful
    }

    /// Plain parameter values, secrets included.
    pub fn param_map(&self) -> ParamMap {
        self.params
            .iter()
            .map(|(name, param)| (name.clone(), param.values.clone()))
            .collect()
    }

    /// Parameter values with secret-typed ones removed.
    pub fn public_param_map(&self) -> ParamMap {
        self.params
            .iter()
            .filter(|(_, param)| param.param_type != ParamType::Secret)
            .map(|(name, param)| (name.clone(), param.values.clone()))
            .collect()
    }

    pub fn key(&self) -> BuildKey {
        BuildKey {
            project_id: self.project_id,
            commit_hash: self.commit_hash.clone(),
            job_name: self.job_name.clone(),
            ref_name: self.ref_name.clone(),
            request: self.request,
            params: self.public_param_map(),
        }
    }

    /// Moves the build to a terminal status and stamps the finish date.
    pub fn finish(&mut self, status: BuildStatus) {
        debug_assert!(status.is_finished());
        self.status = status;
        self.finish_date = Some(Utc::now());
    }

    pub fn mark_pending(&mut self) {
        self.status = BuildStatus::Pending;
        self.pending_date = Some(Utc::now());
    }
}
