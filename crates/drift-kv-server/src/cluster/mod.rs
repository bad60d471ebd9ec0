//! Replication plane: peer transport plus the two controllers that share
//! the engine's log substrate.

pub mod leaderless;
pub mod message;
pub mod primary;
pub mod transport;

use drift_kv::NodeId;
use std::net::SocketAddr;
use std::path::PathBuf;

/// A peer as seen from one node, ordered by ascending node id in configs.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub node_id: NodeId,
    pub repl_addr: SocketAddr,
    /// KV port, when known; used for `not_primary` hints.
    pub kv_port: Option<u16>,
}

/// Configuration for one node of a replicated deployment.
#[derive(Debug, Clone)]
pub struct ClusterNodeConfig {
    pub node_id: NodeId,
    pub kv_port: u16,
    pub repl_port: u16,
    pub data_dir: PathBuf,
    pub peers: Vec<PeerInfo>,
}
