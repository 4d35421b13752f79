use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::cluster::{ClusterCoordinator, ClusterTask};
use crate::grpc::GrpcCluster;
use crate::model::NodeId;
use crate::proto::cluster_service_server::ClusterService;
use crate::proto::{DispatchRequest, DispatchResponse, PingRequest, PingResponse};

/// gRPC service running cluster tasks sent by other nodes
pub struct DispatchService {
    cluster: Arc<GrpcCluster>,
}

impl DispatchService {
    pub fn new(cluster: Arc<GrpcCluster>) -> Self {
        Self { cluster }
    }
}

#[tonic::async_trait]
impl ClusterService for DispatchService {
    async fn dispatch(
        &self,
        request: Request<DispatchRequest>,
    ) -> Result<Response<DispatchResponse>, Status> {
        let req = request.into_inner();
        let task: ClusterTask = serde_json::from_slice(&req.task)
            .map_err(|e| Status::invalid_argument(format!("Invalid task: {}", e)))?;
        tracing::trace!(origin = req.origin, task = task.name(), "Received Dispatch");

        let response = match self.cluster.handle_local(NodeId(req.origin), task).await {
            Ok(output) => DispatchResponse {
                output: serde_json::to_vec(&output)
                    .map_err(|e| Status::internal(format!("Failed to encode output: {}", e)))?,
                error: String::new(),
            },
            Err(e) => DispatchResponse {
                output: Vec::new(),
                error: e.to_string(),
            },
        };
        Ok(Response::new(response))
    }

    async fn ping(&self, request: Request<PingRequest>) -> Result<Response<PingResponse>, Status> {
        tracing::trace!(origin = request.get_ref().origin, "Received Ping");
        Ok(Response::new(PingResponse {
            node_id: self.cluster.local_node().0,
            leader_id: self.cluster.leader().map_or(0, |leader| leader.0),
        }))
    }
}
