//! drift KV server binary.

use clap::{Parser, Subcommand};
use drift_kv_server::bootstrap::{
    self, BoxError, LeaderlessNodeConfig, NodeHandle, SingleConfig,
};
use drift_kv_server::cluster::{ClusterNodeConfig, PeerInfo};
use drift_kv::NodeId;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "drift-kv-server")]
#[command(about = "Durable replicated key-value store server")]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: Level,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a single node without replication
    Single {
        /// KV port to listen on
        #[arg(long, default_value_t = 6380)]
        port: u16,

        /// Data directory for the WAL and snapshots
        #[arg(long, default_value = "./data")]
        data_dir: PathBuf,

        /// Maintain full-text and similarity indexes
        #[arg(long)]
        enable_indexes: bool,
    },
    /// Run one node of a primary/secondary cluster
    Cluster {
        /// This node's id (1-based)
        #[arg(long)]
        node_id: NodeId,

        #[arg(long)]
        kv_port: u16,

        #[arg(long)]
        repl_port: u16,

        /// Replication ports of the other nodes, by ascending node id
        #[arg(long, value_delimiter = ',')]
        secondary_repl_ports: Vec<u16>,

        /// KV ports of the other nodes, by ascending node id
        #[arg(long, value_delimiter = ',')]
        other_kv_ports: Vec<u16>,

        #[arg(long)]
        data_dir: PathBuf,
    },
    /// Run one node of a leaderless (last-writer-wins) cluster
    Leaderless {
        /// This node's id (1-based)
        #[arg(long)]
        node_id: NodeId,

        #[arg(long)]
        kv_port: u16,

        #[arg(long)]
        repl_port: u16,

        /// Replication ports of the other nodes, by ascending node id
        #[arg(long, value_delimiter = ',')]
        peer_repl_ports: Vec<u16>,

        #[arg(long)]
        data_dir: PathBuf,
    },
}

/// Node ids of the other cluster members, ascending, given this node's id
/// and how many peers were listed.
fn peer_node_ids(node_id: NodeId, peer_count: usize) -> Vec<NodeId> {
    (1..=(peer_count as NodeId + 1))
        .filter(|id| *id != node_id)
        .collect()
}

fn local_addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

async fn start(command: Command) -> Result<NodeHandle, BoxError> {
    match command {
        Command::Single {
            port,
            data_dir,
            enable_indexes,
        } => {
            bootstrap::start_single(SingleConfig {
                port,
                data_dir,
                enable_indexes,
            })
            .await
        }
        Command::Cluster {
            node_id,
            kv_port,
            repl_port,
            secondary_repl_ports,
            other_kv_ports,
            data_dir,
        } => {
            if secondary_repl_ports.len() != other_kv_ports.len() {
                return Err("--secondary-repl-ports and --other-kv-ports must list the same nodes"
                    .into());
            }
            let ids = peer_node_ids(node_id, secondary_repl_ports.len());
            let peers = ids
                .into_iter()
                .zip(secondary_repl_ports)
                .zip(other_kv_ports)
                .map(|((peer_id, repl_port), kv_port)| PeerInfo {
                    node_id: peer_id,
                    repl_addr: local_addr(repl_port),
                    kv_port: Some(kv_port),
                })
                .collect();

            bootstrap::start_cluster_node(ClusterNodeConfig {
                node_id,
                kv_port,
                repl_port,
                data_dir,
                peers,
            })
            .await
        }
        Command::Leaderless {
            node_id,
            kv_port,
            repl_port,
            peer_repl_ports,
            data_dir,
        } => {
            bootstrap::start_leaderless_node(LeaderlessNodeConfig {
                node_id,
                kv_port,
                repl_port,
                peer_repl_addrs: peer_repl_ports.into_iter().map(local_addr).collect(),
                data_dir,
            })
            .await
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(cli.log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let handle = start(cli.command).await?;

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    handle.shutdown().await;
    Ok(())
}
