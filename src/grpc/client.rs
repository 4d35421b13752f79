use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tonic::transport::{Channel, Endpoint};

use crate::cluster::{ClusterCoordinator, ClusterTask, TaskHandler, TaskOutput};
use crate::config::NodeConfig;
use crate::error::{MeshError, Result};
use crate::model::NodeId;
use crate::proto::cluster_service_client::ClusterServiceClient;
use crate::proto::{DispatchRequest, PingRequest, PingResponse};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Coordinator reaching peers over gRPC. Leadership is static and comes from
/// the node configuration.
pub struct GrpcCluster {
    node_id: NodeId,
    leader: NodeId,
    peers: HashMap<NodeId, String>,
    handler: RwLock<Option<Weak<dyn TaskHandler>>>,
    /// Connection pool for dispatching tasks to other nodes
    client_pool: Mutex<HashMap<NodeId, ClusterServiceClient<Channel>>>,
}

impl GrpcCluster {
    pub fn new(config: &NodeConfig) -> Arc<Self> {
        Arc::new(Self {
            node_id: NodeId(config.node_id),
            leader: NodeId(config.leader_id),
            peers: config
                .peers
                .iter()
                .map(|peer| (NodeId(peer.node_id), peer.addr.clone()))
                .collect(),
            handler: RwLock::new(None),
            client_pool: Mutex::new(HashMap::new()),
        })
    }

    /// Runs a task with the handler registered on this node.
    pub(crate) async fn handle_local(&self, origin: NodeId, task: ClusterTask) -> Result<TaskOutput> {
        let handler = self
            .handler
            .read()
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or(MeshError::NodeUnavailable(self.node_id))?;
        handler.handle(origin, task).await
    }

    async fn client(&self, node: NodeId) -> Result<ClusterServiceClient<Channel>> {
        let mut pool = self.client_pool.lock().await;
        if let Some(client) = pool.get(&node) {
            return Ok(client.clone());
        }
        let addr = self
            .peers
            .get(&node)
            .ok_or(MeshError::NodeUnavailable(node))?;
        let channel = Endpoint::from_shared(format!("http://{}", addr))
            .map_err(|e| MeshError::Internal(format!("invalid peer address {}: {}", addr, e)))?
            .connect_timeout(CONNECT_TIMEOUT)
            .connect()
            .await?;
        tracing::debug!(node = %node, addr = %addr, "Connected to peer");
        let client = ClusterServiceClient::new(channel);
        pool.insert(node, client.clone());
        Ok(client)
    }

    async fn forget(&self, node: NodeId) {
        self.client_pool.lock().await.remove(&node);
    }

    pub async fn ping(&self, node: NodeId) -> Result<PingResponse> {
        let mut client = self.client(node).await?;
        let response = client
            .ping(PingRequest {
                origin: self.node_id.0,
            })
            .await;
        match response {
            Ok(response) => Ok(response.into_inner()),
            Err(status) => {
                self.forget(node).await;
                Err(status.into())
            }
        }
    }
}

#[async_trait]
impl ClusterCoordinator for GrpcCluster {
    fn local_node(&self) -> NodeId {
        self.node_id
    }

    fn leader(&self) -> Option<NodeId> {
        Some(self.leader)
    }

    fn nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.peers.keys().copied().collect();
        nodes.push(self.node_id);
        nodes.sort();
        nodes.dedup();
        nodes
    }

    fn register_handler(&self, handler: Weak<dyn TaskHandler>) {
        *self.handler.write() = Some(handler);
    }

    async fn call(&self, node: NodeId, task: ClusterTask) -> Result<TaskOutput> {
        if node == self.node_id {
            return self.handle_local(self.node_id, task).await;
        }

        let name = task.name();
        let request = DispatchRequest {
            origin: self.node_id.0,
            task: serde_json::to_vec(&task)?,
        };
        let mut client = self.client(node).await?;
        let response = match client.dispatch(request).await {
            Ok(response) => response.into_inner(),
            Err(status) => {
                tracing::warn!(node = %node, task = name, error = %status, "Dispatch failed");
                self.forget(node).await;
                return Err(status.into());
            }
        };
        if !response.error.is_empty() {
            return Err(MeshError::Remote {
                node,
                message: response.error,
            });
        }
        Ok(serde_json::from_slice(&response.output)?)
    }
}
