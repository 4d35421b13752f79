pub mod auth;
pub mod cache;
pub mod cluster;
pub mod config;
pub mod error;
pub mod events;
pub mod grpc;
pub mod logs;
pub mod model;
pub mod node;
pub mod scheduler;
pub mod shell;
pub mod shutdown;
pub mod steps;
pub mod store;
pub mod worker;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("cluster");
}
