use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cache::{CacheAllocationRequest, CacheAllocations};
use crate::error::{MeshError, Result};
use crate::logs::JobLogger;
use crate::model::spec::matches_patterns;
use crate::model::{ExecutorSettings, JobContext};
use crate::shell::{Shell, Terminal};

pub const AUTO_DISCOVERED: &str = "auto-discovered";

/// Restricts which jobs an executor may run. Each field holds space separated
/// glob patterns; an absent field matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMatch {
    #[serde(default)]
    pub projects: Option<String>,
    #[serde(default)]
    pub branches: Option<String>,
    #[serde(default)]
    pub jobs: Option<String>,
}

/// What a job is matched against. Pull request builds produce one target
/// per side of the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchTarget {
    pub project_path: String,
    pub branch: Option<String>,
    pub job_name: String,
}

impl JobMatch {
    pub fn matches(&self, target: &MatchTarget) -> bool {
        let field = |patterns: &Option<String>, value: Option<&str>| match (patterns, value) {
            (None, _) => true,
            (Some(patterns), Some(value)) => matches_patterns(patterns, value),
            (Some(_), None) => false,
        };
        field(&self.projects, Some(target.project_path.as_str()))
            && field(&self.branches, target.branch.as_deref())
            && field(&self.jobs, Some(target.job_name.as_str()))
    }

    pub fn matches_all(&self, targets: &[MatchTarget]) -> bool {
        targets.iter().all(|t| self.matches(t))
    }
}

/// Services a job executor can call back into while running a job.
#[async_trait]
pub trait JobRuntime: Send + Sync {
    /// Runs `runnable` on the local node, registering it so shells and
    /// resume requests can reach it. Returns when the job is done.
    async fn run_job_local(&self, ctx: &JobContext, runnable: Arc<dyn JobRunnable>) -> Result<()>;

    async fn allocate_caches(
        &self,
        ctx: &JobContext,
        request: CacheAllocationRequest,
    ) -> Result<CacheAllocations>;

    /// Copies artifacts of dependency builds into `target_dir`.
    async fn copy_dependencies(&self, ctx: &JobContext, target_dir: &Path) -> Result<()>;

    async fn run_server_step(
        &self,
        ctx: &JobContext,
        position: &[usize],
        input_dir: &Path,
        placeholders: &BTreeMap<String, String>,
        call_by_agent: bool,
    ) -> Result<BTreeMap<String, Vec<u8>>>;

    async fn report_job_workspace(&self, ctx: &JobContext, workspace: &str) -> Result<()>;

    /// Marks the build paused until [`JobRunnable::resume`] is called.
    async fn report_paused(&self, ctx: &JobContext) -> Result<()>;
}

/// A job running on some node.
#[async_trait]
pub trait JobRunnable: Send + Sync {
    async fn run(&self, logger: &JobLogger) -> Result<()>;

    async fn resume(&self, ctx: &JobContext) -> Result<()>;

    async fn open_shell(&self, ctx: &JobContext, terminal: Arc<dyn Terminal>) -> Result<Arc<dyn Shell>>;
}

#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Runs the job to completion. Failures already written to the job log
    /// should be reported as [`MeshError::JobFailed`].
    async fn execute(&self, ctx: &JobContext, runtime: Arc<dyn JobRuntime>, logger: &JobLogger) -> Result<()>;
}

/// Finds an executor usable on this host when none is configured.
pub trait ExecutorDiscoverer: Send + Sync {
    /// Lower orders are tried first.
    fn order(&self) -> i32;

    fn discover(&self) -> Option<Arc<dyn JobExecutor>>;
}

#[derive(Clone)]
pub struct ResolvedExecutor {
    pub settings: ExecutorSettings,
    pub backend: Arc<dyn JobExecutor>,
}

impl std::fmt::Debug for ResolvedExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedExecutor")
            .field("settings", &self.settings)
            .finish()
    }
}

/// Configured executors in priority order plus auto-discovery fallbacks.
#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    executors: Vec<ResolvedExecutor>,
    discoverers: Vec<Arc<dyn ExecutorDiscoverer>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_executor(mut self, settings: ExecutorSettings, backend: Arc<dyn JobExecutor>) -> Self {
        self.executors.push(ResolvedExecutor { settings, backend });
        self
    }

    pub fn with_discoverer(mut self, discoverer: Arc<dyn ExecutorDiscoverer>) -> Self {
        self.discoverers.push(discoverer);
        self.discoverers.sort_by_key(|d| d.order());
        self
    }

    /// Picks the executor for a job.
    ///
    /// An explicitly named executor must exist, be enabled and accept the
    /// job. Otherwise the first enabled executor accepting the job wins, and
    /// only when no executor is configured at all is auto-discovery tried.
    pub fn resolve(&self, name: Option<&str>, targets: &[MatchTarget]) -> Result<ResolvedExecutor> {
        if let Some(name) = name {
            let executor = self
                .executors
                .iter()
                .find(|e| e.settings.name == name)
                .ok_or_else(|| MeshError::ExecutorNotFound(name.to_string()))?;
            if !executor.settings.enabled {
                return Err(MeshError::ExecutorDisabled(name.to_string()));
            }
            if !accepts(&executor.settings, targets) {
                return Err(MeshError::ExecutorUnauthorized(name.to_string()));
            }
            return Ok(executor.clone());
        }

        if !self.executors.is_empty() {
            return self
                .executors
                .iter()
                .find(|e| e.settings.enabled && accepts(&e.settings, targets))
                .cloned()
                .ok_or_else(|| MeshError::NoExecutorAvailable("No applicable job executor".to_string()));
        }

        for discoverer in &self.discoverers {
            if let Some(backend) = discoverer.discover() {
                tracing::debug!(order = discoverer.order(), "Discovered job executor");
                return Ok(ResolvedExecutor {
                    settings: ExecutorSettings::new(AUTO_DISCOVERED),
                    backend,
                });
            }
        }
        Err(MeshError::NoExecutorAvailable(
            "No job executor discovered".to_string(),
        ))
    }
}

fn accepts(settings: &ExecutorSettings, targets: &[MatchTarget]) -> bool {
    settings
        .job_requirement
        .as_ref()
        .map_or(true, |requirement| requirement.matches_all(targets))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl JobExecutor for Noop {
        async fn execute(&self, _ctx: &JobContext, _runtime: Arc<dyn JobRuntime>, _logger: &JobLogger) -> Result<()> {
            Ok(())
        }
    }

    struct Finds(i32, bool);

    impl ExecutorDiscoverer for Finds {
        fn order(&self) -> i32 {
            self.0
        }

        fn discover(&self) -> Option<Arc<dyn JobExecutor>> {
            self.1.then(|| Arc::new(Noop) as Arc<dyn JobExecutor>)
        }
    }

    fn target(branch: &str) -> MatchTarget {
        MatchTarget {
            project_path: "acme/app".to_string(),
            branch: Some(branch.to_string()),
            job_name: "ci".to_string(),
        }
    }

    fn settings(name: &str, enabled: bool, branches: Option<&str>) -> ExecutorSettings {
        let mut settings = ExecutorSettings::new(name);
        settings.enabled = enabled;
        settings.job_requirement = branches.map(|b| JobMatch {
            branches: Some(b.to_string()),
            ..JobMatch::default()
        });
        settings
    }

    #[test]
    fn explicit_executor_errors() {
        let registry = ExecutorRegistry::new()
            .with_executor(settings("off", false, None), Arc::new(Noop))
            .with_executor(settings("main-only", true, Some("main")), Arc::new(Noop));

        let err = registry.resolve(Some("missing"), &[target("main")]).unwrap_err();
        assert_eq!(err.to_string(), "Unable to find specified job executor 'missing'");

        let err = registry.resolve(Some("off"), &[target("main")]).unwrap_err();
        assert_eq!(err.to_string(), "Specified job executor 'off' is disabled");

        let err = registry.resolve(Some("main-only"), &[target("dev")]).unwrap_err();
        assert!(matches!(err, MeshError::ExecutorUnauthorized(_)));

        assert!(registry.resolve(Some("main-only"), &[target("main")]).is_ok());
    }

    #[test]
    fn first_applicable_executor_wins() {
        let registry = ExecutorRegistry::new()
            .with_executor(settings("off", false, None), Arc::new(Noop))
            .with_executor(settings("release", true, Some("release/*")), Arc::new(Noop))
            .with_executor(settings("any", true, None), Arc::new(Noop));

        let resolved = registry.resolve(None, &[target("release/1.0")]).unwrap();
        assert_eq!(resolved.settings.name, "release");
        let resolved = registry.resolve(None, &[target("dev")]).unwrap();
        assert_eq!(resolved.settings.name, "any");
    }

    #[test]
    fn pull_request_requires_both_sides_to_match() {
        let registry = ExecutorRegistry::new()
            .with_executor(settings("main-only", true, Some("main")), Arc::new(Noop));
        let err = registry
            .resolve(None, &[target("feature"), target("main")])
            .unwrap_err();
        assert_eq!(err.to_string(), "No applicable job executor");
    }

    #[test]
    fn auto_discovery_in_order() {
        let registry = ExecutorRegistry::new()
            .with_discoverer(Arc::new(Finds(10, true)))
            .with_discoverer(Arc::new(Finds(1, false)));
        let resolved = registry.resolve(None, &[target("main")]).unwrap();
        assert_eq!(resolved.settings.name, AUTO_DISCOVERED);

        let empty = ExecutorRegistry::new().with_discoverer(Arc::new(Finds(1, false)));
        let err = empty.resolve(None, &[target("main")]).unwrap_err();
        assert_eq!(err.to_string(), "No job executor discovered");
    }
}
