use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use buildmesh::auth::{MemoryAccessControl, MemorySecretResolver};
use buildmesh::cluster::{ClusterCoordinator, HostedSharedStore};
use buildmesh::config::{NodeConfig, PeerConfig, ProcessConfig};
use buildmesh::grpc::{GrpcCluster, GrpcServer};
use buildmesh::logs::TracingLogSink;
use buildmesh::model::{BuildSpec, NodeId, Project, ProjectId};
use buildmesh::node::{JobManager, Services};
use buildmesh::proto::cluster_service_client::ClusterServiceClient;
use buildmesh::proto::PingRequest;
use buildmesh::shutdown::install_shutdown_handler;
use buildmesh::steps::ArtifactPublisher;
use buildmesh::store::{FsArtifactStore, MemoryBuildStore, MemoryProjectStore};
use buildmesh::worker::process::ProcessDiscoverer;
use buildmesh::worker::ExecutorRegistry;

#[derive(Parser, Debug)]
#[command(name = "buildmesh")]
#[command(version)]
#[command(about = "A distributed CI job scheduler and execution engine")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a buildmesh server node
    Server(ServerArgs),

    /// Validate a build spec file (JSON)
    Validate {
        /// Path to the build spec
        file: PathBuf,
    },

    /// Cluster management commands
    Cluster {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: ClusterCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Node ID (unique identifier for this node)
    #[arg(long, default_value = "1")]
    node_id: u64,

    /// Port to listen on for gRPC
    #[arg(long, default_value = "50051")]
    port: u16,

    /// Peer addresses (comma-separated, format: "id:host:port")
    /// Example: "2:127.0.0.1:50052,3:127.0.0.1:50053"
    #[arg(long, default_value = "")]
    peers: String,

    /// Node leading reconciliation and hosting shared job state
    /// (defaults to the lowest node ID in the cluster)
    #[arg(long)]
    leader: Option<u64>,

    /// Root directory for artifacts, workspaces and caches
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Maximum number of jobs executing concurrently on this node
    #[arg(long, default_value = "16")]
    workers: usize,

    /// JSON file describing projects, commits and refs to serve
    #[arg(long)]
    projects: Option<PathBuf>,

    /// Pause jobs after a failed step until resumed
    #[arg(long)]
    pause_on_failure: bool,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Server address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:50051")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum ClusterCommands {
    /// Ask a node for its identity and the cluster leader
    Ping,
}

// =============================================================================
// Project Seed File
// =============================================================================

#[derive(Deserialize, Debug)]
struct ProjectSeedFile {
    projects: Vec<ProjectSeed>,
}

#[derive(Deserialize, Debug)]
struct ProjectSeed {
    id: u64,
    path: String,
    #[serde(default)]
    default_branch: Option<String>,
    storage_node: u64,
    #[serde(default)]
    commits: Vec<CommitSeed>,
    #[serde(default)]
    refs: BTreeMap<String, String>,
}

#[derive(Deserialize, Debug)]
struct CommitSeed {
    hash: String,
    #[serde(default)]
    parents: Vec<String>,
    #[serde(default)]
    spec: Option<BuildSpec>,
}

fn load_projects(path: &Path) -> Result<MemoryProjectStore, Box<dyn std::error::Error>> {
    let seed: ProjectSeedFile = serde_json::from_slice(&std::fs::read(path)?)?;
    let store = MemoryProjectStore::new();
    for project in seed.projects {
        let project_id = ProjectId(project.id);
        store.add_project(
            Project {
                id: project_id,
                path: project.path.clone(),
                default_branch: project.default_branch,
            },
            NodeId(project.storage_node),
        );
        for commit in project.commits {
            let parents: Vec<&str> = commit.parents.iter().map(String::as_str).collect();
            store.add_commit(project_id, &commit.hash, &parents, commit.spec);
        }
        for (ref_name, commit) in &project.refs {
            store.set_ref(project_id, ref_name, commit);
        }
        tracing::info!(project = %project.path, "Loaded project");
    }
    Ok(store)
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct PingOutput {
    node_id: u64,
    leader_id: u64,
}

#[derive(Serialize)]
struct ValidateOutput {
    valid: bool,
    jobs: Vec<String>,
    error: Option<String>,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn parse_peers(peers_str: &str) -> Vec<PeerConfig> {
    if peers_str.is_empty() {
        return Vec::new();
    }

    peers_str
        .split(',')
        .filter_map(|peer| {
            let parts: Vec<&str> = peer.trim().split(':').collect();
            if parts.len() == 3 {
                let node_id: u64 = parts[0].parse().ok()?;
                let host = parts[1];
                let port = parts[2];
                let addr = format!("{}:{}", host, port);
                Some(PeerConfig { node_id, addr })
            } else {
                tracing::warn!(peer, "Invalid peer format, expected id:host:port");
                None
            }
        })
        .collect()
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let peers = parse_peers(&args.peers);
    let leader_id = args.leader.unwrap_or_else(|| {
        peers
            .iter()
            .map(|p| p.node_id)
            .chain(std::iter::once(args.node_id))
            .min()
            .unwrap_or(args.node_id)
    });

    let mut config = NodeConfig::new(args.node_id, listen_addr).with_leader(leader_id);
    config.peers = peers;
    config.engine = config.engine.with_worker_pool_size(args.workers);
    if let Some(data_dir) = &args.data_dir {
        config.data_dir = data_dir.join("data");
        config.process = ProcessConfig::in_dir(data_dir);
    }
    config.process.pause_on_failure = args.pause_on_failure;

    tracing::info!(
        node_id = config.node_id,
        listen_addr = %config.listen_addr,
        leader_id = config.leader_id,
        data_dir = %config.data_dir.display(),
        peers = ?config.peers.iter().map(|p| format!("{}:{}", p.node_id, p.addr)).collect::<Vec<_>>(),
        "Starting buildmesh node"
    );

    let projects = match &args.projects {
        Some(path) => load_projects(path)?,
        None => MemoryProjectStore::new(),
    };

    let cluster = GrpcCluster::new(&config);
    let coordinator: Arc<dyn ClusterCoordinator> = cluster.clone();
    let artifacts = Arc::new(FsArtifactStore::new(config.data_dir.clone()));
    let services = Services {
        builds: Arc::new(MemoryBuildStore::new()),
        projects: Arc::new(projects),
        artifacts: artifacts.clone(),
        secrets: Arc::new(MemorySecretResolver::new()),
        access: Arc::new(MemoryAccessControl::new()),
        logs: Arc::new(TracingLogSink),
        server_steps: Arc::new(ArtifactPublisher::new(artifacts)),
        shared: Arc::new(HostedSharedStore::new(
            NodeId(config.leader_id),
            coordinator.clone(),
        )),
    };
    let executors =
        ExecutorRegistry::new().with_discoverer(Arc::new(ProcessDiscoverer::new(config.process.clone())));
    let manager = JobManager::new(config.engine.clone(), services, coordinator, executors);

    let shutdown = install_shutdown_handler();
    let server = GrpcServer::new(config.listen_addr, cluster);
    let server_handle = tokio::spawn(server.run(shutdown.child_token()));

    manager.start()?;
    shutdown.cancelled().await;

    manager.shutdown().await;
    match server_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "gRPC server error"),
        Err(e) => tracing::error!(error = %e, "gRPC server task failed"),
    }
    tracing::info!(node_id = config.node_id, "Node stopped");
    Ok(())
}

// =============================================================================
// Command Handlers
// =============================================================================

fn handle_validate(file: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let spec: BuildSpec = serde_json::from_slice(&std::fs::read(file)?)?;
    let jobs: Vec<String> = spec.jobs.iter().map(|j| j.name.clone()).collect();
    let output = match spec.validate() {
        Ok(()) => ValidateOutput {
            valid: true,
            jobs,
            error: None,
        },
        Err(message) => ValidateOutput {
            valid: false,
            jobs,
            error: Some(message),
        },
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    if !output.valid {
        std::process::exit(1);
    }
    Ok(())
}

async fn handle_cluster_ping(
    client_args: &ClientArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = ClusterServiceClient::connect(client_args.addr.clone()).await?;
    let response = client
        .ping(PingRequest { origin: 0 })
        .await?
        .into_inner();

    match client_args.output {
        OutputFormat::Json => {
            let output = PingOutput {
                node_id: response.node_id,
                leader_id: response.leader_id,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Node:   {}", response.node_id);
            println!("Leader: Node {}", response.leader_id);
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Validate { file } => {
            handle_validate(&file)?;
        }
        Commands::Cluster { client, command } => match command {
            ClusterCommands::Ping => {
                handle_cluster_ping(&client).await?;
            }
        },
    }

    Ok(())
}
