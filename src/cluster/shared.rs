use std::collections::{BTreeMap, HashMap};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cluster::{ClusterCoordinator, ClusterTask, TaskOutput};
use crate::error::{MeshError, Result};
use crate::model::NodeId;

pub const JOB_CONTEXTS: &str = "job-contexts";
pub const JOB_SERVERS: &str = "job-servers";
pub const ALLOCATED_CACHES: &str = "allocated-caches";
const CLUSTER_LOCKS: &str = "cluster-locks";

const LOCK_RETRY: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SharedOp {
    Get {
        map: String,
        key: String,
    },
    Entries {
        map: String,
    },
    Put {
        map: String,
        key: String,
        value: Value,
    },
    Remove {
        map: String,
        key: String,
    },
    /// Replaces the entry only if it currently equals `expected`
    /// (`None` meaning absent). A `None` replacement removes the entry.
    CompareAndSet {
        map: String,
        key: String,
        expected: Option<Value>,
        replacement: Option<Value>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reply", content = "value", rename_all = "snake_case")]
pub enum SharedReply {
    Value(Option<Value>),
    Entries(Vec<(String, Value)>),
    Done,
    Swapped(bool),
}

/// String-keyed maps of JSON values visible to every node.
#[async_trait]
pub trait SharedStore: Send + Sync {
    async fn apply(&self, op: SharedOp) -> Result<SharedReply>;
}

/// Shared maps held by the local process.
#[derive(Debug, Default)]
pub struct MemorySharedStore {
    maps: Mutex<HashMap<String, BTreeMap<String, Value>>>,
}

impl MemorySharedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply_local(&self, op: SharedOp) -> SharedReply {
        let mut maps = self.maps.lock();
        match op {
            SharedOp::Get { map, key } => {
                SharedReply::Value(maps.get(&map).and_then(|m| m.get(&key)).cloned())
            }
            SharedOp::Entries { map } => SharedReply::Entries(
                maps.get(&map)
                    .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                    .unwrap_or_default(),
            ),
            SharedOp::Put { map, key, value } => {
                maps.entry(map).or_default().insert(key, value);
                SharedReply::Done
            }
            SharedOp::Remove { map, key } => {
                if let Some(m) = maps.get_mut(&map) {
                    m.remove(&key);
                }
                SharedReply::Done
            }
            SharedOp::CompareAndSet {
                map,
                key,
                expected,
                replacement,
            } => {
                let entries = maps.entry(map).or_default();
                if entries.get(&key) != expected.as_ref() {
                    return SharedReply::Swapped(false);
                }
                match replacement {
                    Some(value) => entries.insert(key, value),
                    None => entries.remove(&key),
                };
                SharedReply::Swapped(true)
            }
        }
    }
}

#[async_trait]
impl SharedStore for MemorySharedStore {
    async fn apply(&self, op: SharedOp) -> Result<SharedReply> {
        Ok(self.apply_local(op))
    }
}

/// Shared store hosted by one node. Other nodes forward every operation
/// to the host through the coordinator.
pub struct HostedSharedStore {
    host: NodeId,
    local: Arc<MemorySharedStore>,
    coordinator: Arc<dyn ClusterCoordinator>,
}

impl HostedSharedStore {
    pub fn new(host: NodeId, coordinator: Arc<dyn ClusterCoordinator>) -> Self {
        Self {
            host,
            local: Arc::new(MemorySharedStore::new()),
            coordinator,
        }
    }
}

#[async_trait]
impl SharedStore for HostedSharedStore {
    async fn apply(&self, op: SharedOp) -> Result<SharedReply> {
        if self.coordinator.local_node() == self.host {
            return Ok(self.local.apply_local(op));
        }
        match self.coordinator.call(self.host, ClusterTask::Shared(op)).await? {
            TaskOutput::Shared(reply) => Ok(reply),
            other => Err(MeshError::Internal(format!(
                "unexpected shared store reply: {:?}",
                other
            ))),
        }
    }
}

fn unexpected(reply: SharedReply) -> MeshError {
    MeshError::Internal(format!("unexpected shared store reply: {:?}", reply))
}

/// Typed view of one shared map.
pub struct SharedMap<T> {
    name: &'static str,
    store: Arc<dyn SharedStore>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for SharedMap<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            store: self.store.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Serialize + DeserializeOwned> SharedMap<T> {
    pub fn new(name: &'static str, store: Arc<dyn SharedStore>) -> Self {
        Self {
            name,
            store,
            _marker: PhantomData,
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<T>> {
        let reply = self
            .store
            .apply(SharedOp::Get {
                map: self.name.to_string(),
                key: key.to_string(),
            })
            .await?;
        match reply {
            SharedReply::Value(Some(value)) => Ok(Some(serde_json::from_value(value)?)),
            SharedReply::Value(None) => Ok(None),
            other => Err(unexpected(other)),
        }
    }

    pub async fn entries(&self) -> Result<Vec<(String, T)>> {
        let reply = self
            .store
            .apply(SharedOp::Entries {
                map: self.name.to_string(),
            })
            .await?;
        match reply {
            SharedReply::Entries(entries) => entries
                .into_iter()
                .map(|(key, value)| Ok((key, serde_json::from_value(value)?)))
                .collect(),
            other => Err(unexpected(other)),
        }
    }

    pub async fn put(&self, key: &str, value: &T) -> Result<()> {
        self.store
            .apply(SharedOp::Put {
                map: self.name.to_string(),
                key: key.to_string(),
                value: serde_json::to_value(value)?,
            })
            .await?;
        Ok(())
    }

    pub async fn remove(&self, key: &str) -> Result<()> {
        self.store
            .apply(SharedOp::Remove {
                map: self.name.to_string(),
                key: key.to_string(),
            })
            .await?;
        Ok(())
    }

    pub async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&T>,
        replacement: Option<&T>,
    ) -> Result<bool> {
        let expected = expected.map(serde_json::to_value).transpose()?;
        let replacement = replacement.map(serde_json::to_value).transpose()?;
        let reply = self
            .store
            .apply(SharedOp::CompareAndSet {
                map: self.name.to_string(),
                key: key.to_string(),
                expected,
                replacement,
            })
            .await?;
        match reply {
            SharedReply::Swapped(swapped) => Ok(swapped),
            other => Err(unexpected(other)),
        }
    }
}

/// Cluster-wide mutual exclusion built on compare-and-set.
pub struct ClusterLock {
    locks: SharedMap<String>,
    name: String,
    owner: String,
    released: bool,
}

impl ClusterLock {
    /// Waits until the named lock is free and takes it.
    pub async fn acquire(store: Arc<dyn SharedStore>, name: &str) -> Result<Self> {
        let locks = SharedMap::<String>::new(CLUSTER_LOCKS, store);
        let owner = uuid::Uuid::new_v4().to_string();
        while !locks.compare_and_set(name, None, Some(&owner)).await? {
            tokio::time::sleep(LOCK_RETRY).await;
        }
        tracing::trace!(lock = name, "Acquired cluster lock");
        Ok(Self {
            locks,
            name: name.to_string(),
            owner,
            released: false,
        })
    }

    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        self.locks
            .compare_and_set(&self.name, Some(&self.owner), None)
            .await?;
        Ok(())
    }
}

impl Drop for ClusterLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let locks = self.locks.clone();
        let name = std::mem::take(&mut self.name);
        let owner = std::mem::take(&mut self.owner);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = locks.compare_and_set(&name, Some(&owner), None).await {
                    tracing::warn!(lock = %name, error = %e, "Failed to release cluster lock");
                }
            });
        }
    }
}
