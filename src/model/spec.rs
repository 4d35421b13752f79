//! Declarative build spec types.
//!
//! The spec grammar is owned by the project store; the job core only consumes
//! the parsed form below and validates the constraints it depends on.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::model::{Build, BuildStatus};

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    30
}

fn default_timeout() -> u64 {
    3600
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildSpec {
    #[serde(default)]
    pub jobs: Vec<JobSpec>,
    #[serde(default)]
    pub services: Vec<Service>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    /// Executor name, may reference variables.
    #[serde(default)]
    pub executor: Option<String>,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub params: Vec<ParamSpec>,
    #[serde(default)]
    pub job_dependencies: Vec<JobDependency>,
    #[serde(default)]
    pub project_dependencies: Vec<ProjectDependency>,
    #[serde(default)]
    pub required_services: Vec<String>,
    #[serde(default)]
    pub caches: Vec<CacheSpec>,
    #[serde(default)]
    pub triggers: Vec<JobTrigger>,
    #[serde(default)]
    pub post_build_actions: Vec<PostBuildAction>,
    #[serde(default)]
    pub retry_condition: RetryCondition,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base retry delay in seconds.
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,
    /// Timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

impl JobSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            executor: None,
            steps: Vec::new(),
            params: Vec::new(),
            job_dependencies: Vec::new(),
            project_dependencies: Vec::new(),
            required_services: Vec::new(),
            caches: Vec::new(),
            triggers: Vec::new(),
            post_build_actions: Vec::new(),
            retry_condition: RetryCondition::default(),
            max_retries: default_max_retries(),
            retry_delay: default_retry_delay(),
            timeout: default_timeout(),
        }
    }

    pub fn param_spec(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    #[serde(flatten)]
    pub kind: StepKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Shell commands run by the executor.
    Command {
        #[serde(default)]
        image: Option<String>,
        commands: String,
    },
    /// Step run on the server holding the project's storage.
    Server {
        step_type: String,
        #[serde(default)]
        properties: BTreeMap<String, String>,
    },
    Composite { steps: Vec<Step> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParamType {
    Text,
    Integer,
    Boolean,
    Choice { choices: Vec<String> },
    Secret,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(flatten)]
    pub param_type: ParamType,
    #[serde(default)]
    pub allow_empty: bool,
    #[serde(default)]
    pub allow_multiple: bool,
}

/// Values supplied for one parameter: each inner list is one alternative,
/// and alternatives of all supplied parameters are cross-multiplied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSupply {
    pub name: String,
    pub values: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDependency {
    pub job_name: String,
    #[serde(default = "default_true")]
    pub require_successful: bool,
    #[serde(default)]
    pub params: Vec<ParamSupply>,
    #[serde(default)]
    pub artifacts: Option<String>,
    #[serde(default)]
    pub destination_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum BuildSelector {
    LastSuccessful {
        job_name: String,
        #[serde(default)]
        ref_name: Option<String>,
    },
    Number { number: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectDependency {
    pub project_path: String,
    pub build: BuildSelector,
    /// Name of the job secret holding an access token for the project.
    #[serde(default)]
    pub access_token_secret: Option<String>,
    #[serde(default)]
    pub artifacts: Option<String>,
    #[serde(default)]
    pub destination_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSpec {
    pub key: String,
    pub path: String,
}

impl CacheSpec {
    /// Cache key with characters outside `[A-Za-z0-9._-]` replaced by `-`.
    pub fn normalized_key(&self) -> String {
        self.key
            .trim()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                    c
                } else {
                    '-'
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobTrigger {
    #[serde(flatten)]
    pub kind: TriggerKind,
    #[serde(default)]
    pub params: Vec<ParamSupply>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "on", rename_all = "snake_case")]
pub enum TriggerKind {
    /// Space separated branch patterns, all branches when absent.
    BranchUpdate {
        #[serde(default)]
        branches: Option<String>,
    },
    TagCreate {
        #[serde(default)]
        tags: Option<String>,
    },
    /// Pull requests targeting matching branches.
    PullRequest {
        #[serde(default)]
        branches: Option<String>,
    },
    /// Cron expression with a seconds field, evaluated on the default branch.
    Schedule { cron_expression: String },
    /// A build of one of the job's dependencies finished. The triggered
    /// build joins the pipeline of the finished one.
    DependencyFinished,
}

/// Runs after a build of the job finishes, when `condition` holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostBuildAction {
    #[serde(default)]
    pub condition: ActionCondition,
    #[serde(flatten)]
    pub kind: PostBuildActionKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PostBuildActionKind {
    /// Submits another job of the same commit into the build's pipeline.
    /// Job name and param values may reference variables.
    RunJob {
        job_name: String,
        #[serde(default)]
        params: Vec<ParamSupply>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionCondition {
    #[default]
    Always,
    Successful,
    Failed,
    Cancelled,
    TimedOut,
    ParamIs {
        name: String,
        value: String,
    },
    Any(Vec<ActionCondition>),
    All(Vec<ActionCondition>),
    Not(Box<ActionCondition>),
}

impl ActionCondition {
    pub fn matches(&self, build: &Build) -> bool {
        match self {
            ActionCondition::Always => true,
            ActionCondition::Successful => build.status == BuildStatus::Successful,
            ActionCondition::Failed => build.status == BuildStatus::Failed,
            ActionCondition::Cancelled => build.status == BuildStatus::Cancelled,
            ActionCondition::TimedOut => build.status == BuildStatus::TimedOut,
            ActionCondition::ParamIs { name, value } => build
                .params
                .get(name)
                .map_or(false, |param| param.values.iter().any(|v| v == value)),
            ActionCondition::Any(conditions) => conditions.iter().any(|c| c.matches(build)),
            ActionCondition::All(conditions) => conditions.iter().all(|c| c.matches(build)),
            ActionCondition::Not(condition) => !condition.matches(build),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryCondition {
    #[default]
    Never,
    Always,
    ErrorContains(String),
    ErrorMatches(String),
    ParamIs {
        name: String,
        value: String,
    },
    Any(Vec<RetryCondition>),
    All(Vec<RetryCondition>),
}

impl RetryCondition {
    pub fn matches(&self, build: &Build, error_message: &str) -> bool {
        match self {
            RetryCondition::Never => false,
            RetryCondition::Always => true,
            RetryCondition::ErrorContains(text) => error_message.contains(text.as_str()),
            RetryCondition::ErrorMatches(pattern) => regex::Regex::new(pattern)
                .map(|re| re.is_match(error_message))
                .unwrap_or(false),
            RetryCondition::ParamIs { name, value } => build
                .params
                .get(name)
                .map(|param| param.values.iter().any(|v| v == value))
                .unwrap_or(false),
            RetryCondition::Any(conditions) => {
                conditions.iter().any(|c| c.matches(build, error_message))
            }
            RetryCondition::All(conditions) => {
                conditions.iter().all(|c| c.matches(build, error_message))
            }
        }
    }

    fn validate(&self) -> Result<(), String> {
        match self {
            RetryCondition::ErrorMatches(pattern) => regex::Regex::new(pattern)
                .map(|_| ())
                .map_err(|e| format!("invalid retry pattern '{}': {}", pattern, e)),
            RetryCondition::Any(conditions) | RetryCondition::All(conditions) => {
                conditions.iter().try_for_each(RetryCondition::validate)
            }
            _ => Ok(()),
        }
    }
}

/// Whether `value` matches any of the space separated glob `patterns`.
pub fn matches_patterns(patterns: &str, value: &str) -> bool {
    patterns.split_whitespace().any(|pattern| {
        glob::Pattern::new(pattern)
            .map(|p| p.matches(value))
            .unwrap_or(false)
    })
}

impl BuildSpec {
    pub fn job(&self, name: &str) -> Option<&JobSpec> {
        self.jobs.iter().find(|j| j.name == name)
    }

    pub fn service(&self, name: &str) -> Option<&Service> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Checks the structural constraints the job core relies on.
    pub fn validate(&self) -> Result<(), String> {
        let mut names = HashSet::new();
        for job in &self.jobs {
            if job.name.trim().is_empty() {
                return Err("job name must not be empty".to_string());
            }
            if !names.insert(job.name.as_str()) {
                return Err(format!("duplicate job '{}'", job.name));
            }
        }

        let mut service_names = HashSet::new();
        for service in &self.services {
            if !service_names.insert(service.name.as_str()) {
                return Err(format!("duplicate service '{}'", service.name));
            }
        }

        for job in &self.jobs {
            let location = format!("jobs.{}", job.name);
            if job.timeout == 0 {
                return Err(format!("{}: timeout must be positive", location));
            }

            let mut param_names = HashSet::new();
            for param in &job.params {
                if !param_names.insert(param.name.as_str()) {
                    return Err(format!("{}: duplicate param '{}'", location, param.name));
                }
            }

            for dependency in &job.job_dependencies {
                let Some(target) = self.job(&dependency.job_name) else {
                    return Err(format!(
                        "{}: dependency job '{}' not found",
                        location, dependency.job_name
                    ));
                };
                for supply in &dependency.params {
                    if target.param_spec(&supply.name).is_none() {
                        return Err(format!(
                            "{}: param '{}' is not defined in job '{}'",
                            location, supply.name, target.name
                        ));
                    }
                }
            }

            for service in &job.required_services {
                if self.service(service).is_none() {
                    return Err(format!("{}: service '{}' not found", location, service));
                }
            }

            for trigger in &job.triggers {
                if let TriggerKind::Schedule { cron_expression } = &trigger.kind {
                    cron::Schedule::from_str(cron_expression).map_err(|e| {
                        format!(
                            "{}: invalid cron expression '{}': {}",
                            location, cron_expression, e
                        )
                    })?;
                }
            }

            for action in &job.post_build_actions {
                let PostBuildActionKind::RunJob { job_name, .. } = &action.kind;
                if !job_name.contains('@') && self.job(job_name).is_none() {
                    return Err(format!(
                        "{}: post build action job '{}' not found",
                        location, job_name
                    ));
                }
            }

            job.retry_condition
                .validate()
                .map_err(|e| format!("{}: {}", location, e))?;
        }

        self.check_dependency_cycles()
    }

    fn check_dependency_cycles(&self) -> Result<(), String> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        let mut marks: HashMap<&str, Mark> = HashMap::new();
        for job in &self.jobs {
            if marks.contains_key(job.name.as_str()) {
                continue;
            }
            // (job, index of next dependency to visit)
            let mut stack: Vec<(&JobSpec, usize)> = vec![(job, 0)];
            marks.insert(job.name.as_str(), Mark::Visiting);
            while let Some((current, next)) = stack.pop() {
                if let Some(dependency) = current.job_dependencies.get(next) {
                    stack.push((current, next + 1));
                    let name = dependency.job_name.as_str();
                    match marks.get(name) {
                        Some(Mark::Visiting) => {
                            return Err(format!(
                                "circular job dependency between '{}' and '{}'",
                                current.name, name
                            ));
                        }
                        Some(Mark::Done) => {}
                        None => {
                            if let Some(target) = self.job(name) {
                                marks.insert(name, Mark::Visiting);
                                stack.push((target, 0));
                            }
                        }
                    }
                } else {
                    marks.insert(current.name.as_str(), Mark::Done);
                }
            }
        }
        Ok(())
    }
}
