//! Cache slot allocation.
//!
//! Executors keep content-keyed cache instances on their hosts. Before a job
//! runs, the executor reports the instances it knows about and the leader
//! decides, under a cluster-wide lock, which instance each of the job's
//! cache specs gets and which stale instances should be deleted.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::cluster::{ClusterLock, ClusterTask, TaskOutput};
use crate::error::{MeshError, Result};
use crate::model::{CacheSpec, JobContext};
use crate::node::JobManager;

const ALLOCATION_LOCK: &str = "allocate-caches";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheInstance {
    pub name: String,
    /// Normalized cache key.
    pub key: String,
}

impl CacheInstance {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            name: uuid::Uuid::new_v4().to_string(),
            key: key.into(),
        }
    }

    pub fn directory(&self, cache_root: &Path) -> PathBuf {
        cache_root.join(&self.key).join(&self.name)
    }
}

/// Instances known to an executor with their last used time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheAllocationRequest {
    pub current_time: DateTime<Utc>,
    pub instances: Vec<(CacheInstance, DateTime<Utc>)>,
}

/// Instance to the path it is mounted at for the job, or `None` when the
/// instance should be deleted.
pub type CacheAllocations = BTreeMap<CacheInstance, Option<String>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePlan {
    pub allocations: CacheAllocations,
    /// Names of the instances now held by the job, the ones it deletes
    /// included.
    pub allocated_names: Vec<String>,
}

/// Decides the allocation for one job.
///
/// `taken` holds the instance names allocated to other active jobs.
pub fn plan_allocation(
    specs: &[CacheSpec],
    request: &CacheAllocationRequest,
    taken: &HashSet<String>,
    ttl_millis: i64,
) -> CachePlan {
    let mut instances = request.instances.clone();
    instances.sort_by(|(a, a_used), (b, b_used)| b_used.cmp(a_used).then_with(|| a.name.cmp(&b.name)));

    let mut allocations = CacheAllocations::new();
    let mut allocated_names = Vec::new();
    for spec in specs {
        let key = spec.normalized_key();
        let reusable = instances.iter().map(|(instance, _)| instance).find(|instance| {
            instance.key == key
                && !taken.contains(&instance.name)
                && !allocations.contains_key(*instance)
        });
        let instance = match reusable {
            Some(instance) => instance.clone(),
            None => CacheInstance::new(key),
        };
        allocated_names.push(instance.name.clone());
        allocations.insert(instance, Some(spec.path.clone()));
    }

    for (instance, last_used) in &instances {
        if allocations.contains_key(instance) || taken.contains(&instance.name) {
            continue;
        }
        let idle = request.current_time.signed_duration_since(*last_used);
        if idle.num_milliseconds() > ttl_millis {
            // Claimed by this job while its host deletes it
            allocated_names.push(instance.name.clone());
            allocations.insert(instance.clone(), None);
        }
    }

    CachePlan {
        allocations,
        allocated_names,
    }
}

impl JobManager {
    /// Allocates cache instances for a running job. Runs on the leader.
    pub async fn allocate_caches(
        &self,
        ctx: &JobContext,
        request: CacheAllocationRequest,
    ) -> Result<CacheAllocations> {
        let task = ClusterTask::AllocateCaches {
            job_token: ctx.job_token.clone(),
            request,
        };
        match self
            .dispatcher
            .run_on_leader(task, &CancellationToken::new())
            .await?
        {
            TaskOutput::Caches(allocations) => Ok(allocations.into_iter().collect()),
            other => Err(MeshError::Internal(format!(
                "unexpected cache allocation output: {:?}",
                other
            ))),
        }
    }

    pub(crate) async fn allocate_caches_locked(
        &self,
        job_token: &str,
        request: &CacheAllocationRequest,
    ) -> Result<CacheAllocations> {
        let ctx = self
            .get_job_context(job_token, true)
            .await?
            .ok_or(MeshError::JobContextNotFound)?;

        let lock = ClusterLock::acquire(self.shared.clone(), ALLOCATION_LOCK).await?;
        let result = self.allocate_with_lock_held(&ctx, request).await;
        lock.release().await?;
        result
    }

    async fn allocate_with_lock_held(
        &self,
        ctx: &JobContext,
        request: &CacheAllocationRequest,
    ) -> Result<CacheAllocations> {
        let active: HashSet<String> = self
            .job_contexts
            .entries()
            .await?
            .into_iter()
            .map(|(token, _)| token)
            .collect();

        let mut taken = HashSet::new();
        for (token, names) in self.allocated_caches.entries().await? {
            if !active.contains(&token) {
                self.allocated_caches.remove(&token).await?;
            } else if token != ctx.job_token {
                taken.extend(names);
            }
        }

        let plan = plan_allocation(
            &ctx.cache_specs,
            request,
            &taken,
            ctx.executor.cache_ttl_millis(),
        );
        self.allocated_caches
            .put(&ctx.job_token, &plan.allocated_names)
            .await?;

        tracing::debug!(
            job_token = %ctx.job_token,
            allocated = plan.allocations.values().filter(|p| p.is_some()).count(),
            deleted = plan.allocations.values().filter(|p| p.is_none()).count(),
            "Allocated caches"
        );
        Ok(plan.allocations)
    }
}
