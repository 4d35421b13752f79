//! gRPC transport between cluster nodes.
//!
//! Every node serves [`DispatchService`](cluster_service::DispatchService);
//! [`GrpcCluster`] is the matching [`ClusterCoordinator`](crate::cluster::ClusterCoordinator).

pub mod client;
pub mod cluster_service;
pub mod server;

pub use client::GrpcCluster;
pub use server::GrpcServer;
