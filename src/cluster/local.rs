use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::cluster::{ClusterCoordinator, ClusterTask, TaskHandler, TaskOutput};
use crate::error::{MeshError, Result};
use crate::model::NodeId;

/// In-process "network" joining any number of [`LocalCluster`] members.
///
/// Tasks are delivered by calling the target member's handler directly.
/// Errors are returned to the caller unchanged.
#[derive(Default)]
pub struct LocalNetwork {
    members: RwLock<BTreeSet<NodeId>>,
    handlers: RwLock<HashMap<NodeId, Weak<dyn TaskHandler>>>,
    leader: RwLock<Option<NodeId>>,
    down: RwLock<HashSet<NodeId>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Adds a member. The first member to join becomes the leader.
    pub fn join(self: &Arc<Self>, node: NodeId) -> Arc<LocalCluster> {
        self.members.write().insert(node);
        let mut leader = self.leader.write();
        if leader.is_none() {
            *leader = Some(node);
        }
        Arc::new(LocalCluster {
            network: self.clone(),
            node,
        })
    }

    pub fn set_leader(&self, node: Option<NodeId>) {
        tracing::info!(leader = ?node.map(|n| n.0), "Leader changed");
        *self.leader.write() = node;
    }

    /// Marks a member unreachable; calls to it fail with `NodeUnavailable`.
    pub fn set_down(&self, node: NodeId, down: bool) {
        if down {
            self.down.write().insert(node);
        } else {
            self.down.write().remove(&node);
        }
    }
}

pub struct LocalCluster {
    network: Arc<LocalNetwork>,
    node: NodeId,
}

impl LocalCluster {
    /// A single member network, for one-node deployments.
    pub fn standalone(node: NodeId) -> Arc<Self> {
        LocalNetwork::new().join(node)
    }

    pub fn network(&self) -> &Arc<LocalNetwork> {
        &self.network
    }
}

#[async_trait]
impl ClusterCoordinator for LocalCluster {
    fn local_node(&self) -> NodeId {
        self.node
    }

    fn leader(&self) -> Option<NodeId> {
        *self.network.leader.read()
    }

    fn nodes(&self) -> Vec<NodeId> {
        self.network.members.read().iter().copied().collect()
    }

    fn register_handler(&self, handler: Weak<dyn TaskHandler>) {
        self.network.handlers.write().insert(self.node, handler);
    }

    async fn call(&self, node: NodeId, task: ClusterTask) -> Result<TaskOutput> {
        if self.network.down.read().contains(&node) {
            return Err(MeshError::NodeUnavailable(node));
        }
        let handler = self
            .network
            .handlers
            .read()
            .get(&node)
            .and_then(Weak::upgrade)
            .ok_or(MeshError::NodeUnavailable(node))?;
        tracing::trace!(from = %self.node, to = %node, task = task.name(), "Delivering cluster task");
        handler.handle(self.node, task).await
    }
}
