use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::grpc::cluster_service::DispatchService;
use crate::grpc::GrpcCluster;
use crate::proto::cluster_service_server::ClusterServiceServer;

pub struct GrpcServer {
    addr: SocketAddr,
    cluster: Arc<GrpcCluster>,
}

impl GrpcServer {
    pub fn new(addr: SocketAddr, cluster: Arc<GrpcCluster>) -> Self {
        Self { addr, cluster }
    }

    /// Serves until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), tonic::transport::Error> {
        let service = DispatchService::new(self.cluster.clone());

        tracing::info!(addr = %self.addr, "Starting gRPC server");

        Server::builder()
            .add_service(ClusterServiceServer::new(service))
            .serve_with_shutdown(self.addr, async move { shutdown.cancelled().await })
            .await
    }
}
