use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Tuning of the job manager running on every node.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Period of the reconciliation loop.
    pub reconcile_interval: Duration,
    /// Maximum number of jobs executing concurrently on this node,
    /// retry backoff included.
    pub worker_pool_size: usize,
    /// Capacity of the build event channel.
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_millis(1000),
            worker_pool_size: 16,
            event_capacity: 1024,
        }
    }
}

impl EngineConfig {
    pub fn with_reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = interval;
        self
    }

    pub fn with_worker_pool_size(mut self, size: usize) -> Self {
        self.worker_pool_size = size.max(1);
        self
    }
}

/// Configuration of the built-in process executor.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Parent directory of per-job workspaces.
    pub work_dir: PathBuf,
    /// Root of cache instances, laid out as `<key>/<instance>`.
    pub cache_dir: PathBuf,
    /// Shell used to run command steps (`<shell> -c <commands>`).
    pub shell: String,
    /// Pause the job after a failed step until it is resumed.
    pub pause_on_failure: bool,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        let base = std::env::temp_dir().join("buildmesh");
        Self {
            work_dir: base.join("work"),
            cache_dir: base.join("cache"),
            shell: "sh".to_string(),
            pause_on_failure: false,
        }
    }
}

impl ProcessConfig {
    pub fn in_dir(base: impl Into<PathBuf>) -> Self {
        let base = base.into();
        Self {
            work_dir: base.join("work"),
            cache_dir: base.join("cache"),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: u64,
    pub listen_addr: SocketAddr,
    pub peers: Vec<PeerConfig>,
    /// Node leading reconciliation and hosting the shared maps.
    pub leader_id: u64,
    /// Artifact storage root.
    pub data_dir: PathBuf,
    pub engine: EngineConfig,
    pub process: ProcessConfig,
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub node_id: u64,
    /// `host:port`, resolved when the peer is first dialed.
    pub addr: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            listen_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 50051)),
            peers: Vec::new(),
            leader_id: 1,
            data_dir: std::env::temp_dir().join("buildmesh").join("data"),
            engine: EngineConfig::default(),
            process: ProcessConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn new(node_id: u64, listen_addr: SocketAddr) -> Self {
        Self {
            node_id,
            listen_addr,
            leader_id: node_id,
            ..Default::default()
        }
    }

    pub fn with_peer(mut self, node_id: u64, addr: String) -> Self {
        self.peers.push(PeerConfig { node_id, addr });
        self
    }

    pub fn with_leader(mut self, leader_id: u64) -> Self {
        self.leader_id = leader_id;
        self
    }

    pub fn is_leader(&self) -> bool {
        self.node_id == self.leader_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_config_default() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.reconcile_interval, Duration::from_secs(1));
        assert_eq!(cfg.worker_pool_size, 16);
    }

    #[test]
    fn worker_pool_is_never_empty() {
        let cfg = EngineConfig::default().with_worker_pool_size(0);
        assert_eq!(cfg.worker_pool_size, 1);
    }

    #[test]
    fn process_config_in_dir() {
        let cfg = ProcessConfig::in_dir("/var/lib/mesh");
        assert_eq!(cfg.work_dir, PathBuf::from("/var/lib/mesh/work"));
        assert_eq!(cfg.cache_dir, PathBuf::from("/var/lib/mesh/cache"));
        assert_eq!(cfg.shell, "sh");
    }

    #[test]
    fn node_config_default() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.node_id, 1);
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:50051");
        assert!(cfg.peers.is_empty());
        assert!(cfg.is_leader());
    }

    #[test]
    fn node_config_new_leads_itself() {
        let addr: SocketAddr = "10.0.0.1:9000".parse().unwrap();
        let cfg = NodeConfig::new(42, addr);
        assert_eq!(cfg.node_id, 42);
        assert_eq!(cfg.listen_addr, addr);
        assert!(cfg.is_leader());
        assert!(!cfg.with_leader(1).is_leader());
    }

    #[test]
    fn peers_keep_insertion_order() {
        let cfg = NodeConfig::default()
            .with_peer(3, "mesh-3:7000".to_string())
            .with_peer(2, "mesh-2:7000".to_string());
        let ids: Vec<u64> = cfg.peers.iter().map(|p| p.node_id).collect();
        assert_eq!(ids, vec![3, 2]);
        assert_eq!(cfg.peers[1].addr, "mesh-2:7000");
    }
}
