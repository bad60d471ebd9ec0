//! Node composition.
//!
//! Wires the engine, controllers and listeners together for each deployment
//! mode and hands back a [`NodeHandle`]. The binary and the integration
//! tests go through the same paths; tests pass pre-bound listeners so they
//! can run whole clusters on ephemeral ports.

use crate::cluster::leaderless::Leaderless;
use crate::cluster::primary::PrimarySecondary;
use crate::cluster::transport::{self, PeerHandler};
use crate::cluster::ClusterNodeConfig;
use crate::index::Indexes;
use crate::server::{KvServer, LocalWritePath, WritePath};
use drift_kv::{EngineConfig, NodeId, StateEngine};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Configuration for single-node operation.
#[derive(Debug, Clone)]
pub struct SingleConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub enable_indexes: bool,
}

/// Configuration for one node of a leaderless deployment.
#[derive(Debug, Clone)]
pub struct LeaderlessNodeConfig {
    pub node_id: NodeId,
    pub kv_port: u16,
    pub repl_port: u16,
    pub peer_repl_addrs: Vec<SocketAddr>,
    pub data_dir: PathBuf,
}

/// A running node.
pub struct NodeHandle {
    pub engine: Arc<StateEngine>,
    pub kv_addr: SocketAddr,
    pub repl_addr: Option<SocketAddr>,
    pub controller: Option<Arc<PrimarySecondary>>,
    tasks: Vec<JoinHandle<()>>,
}

impl NodeHandle {
    /// Graceful shutdown: stop serving, drain the writer queue and write a
    /// final snapshot.
    pub async fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        self.engine.shutdown().await;
    }

    /// Hard stop without the final snapshot, as if the process were killed.
    pub fn abort(self) {
        for task in &self.tasks {
            task.abort();
        }
        std::mem::forget(self.engine);
    }
}

/// Start a single node without replication.
pub async fn start_single(config: SingleConfig) -> Result<NodeHandle, BoxError> {
    let mut engine_config = EngineConfig::new(&config.data_dir, 0);
    engine_config.truncate_wal_on_snapshot = true;
    let engine = Arc::new(StateEngine::open(engine_config)?);

    let indexes = if config.enable_indexes {
        let indexes = Arc::new(Indexes::new());
        indexes.attach(&engine);
        Some(indexes)
    } else {
        None
    };

    let listener = TcpListener::bind(("127.0.0.1", config.port)).await?;
    let kv_addr = listener.local_addr()?;
    let write_path: Arc<dyn WritePath> = Arc::new(LocalWritePath::new(engine.clone()));
    let server = Arc::new(KvServer::new(engine.clone(), write_path, indexes));
    let task = tokio::spawn(async move {
        if let Err(e) = server.run(listener).await {
            error!("kv server failed: {}", e);
        }
    });

    info!("single node serving on {}", kv_addr);
    Ok(NodeHandle {
        engine,
        kv_addr,
        repl_addr: None,
        controller: None,
        tasks: vec![task],
    })
}

/// Start a primary/secondary cluster node, binding its own listeners.
pub async fn start_cluster_node(config: ClusterNodeConfig) -> Result<NodeHandle, BoxError> {
    let kv_listener = TcpListener::bind(("127.0.0.1", config.kv_port)).await?;
    let repl_listener = TcpListener::bind(("127.0.0.1", config.repl_port)).await?;
    start_cluster_node_on(config, kv_listener, repl_listener).await
}

/// Start a primary/secondary cluster node on pre-bound listeners.
pub async fn start_cluster_node_on(
    config: ClusterNodeConfig,
    kv_listener: TcpListener,
    repl_listener: TcpListener,
) -> Result<NodeHandle, BoxError> {
    let kv_addr = kv_listener.local_addr()?;
    let repl_addr = repl_listener.local_addr()?;

    let engine_config = EngineConfig::new(&config.data_dir, config.node_id);
    let engine = Arc::new(StateEngine::open(engine_config)?);
    let node_id = config.node_id;

    let controller = PrimarySecondary::new(engine.clone(), config);
    let tick_task = controller.spawn();

    let handler: Arc<dyn PeerHandler> = controller.clone();
    let repl_task = tokio::spawn(async move {
        if let Err(e) = transport::serve(repl_listener, handler).await {
            error!("replication listener failed: {}", e);
        }
    });

    let write_path: Arc<dyn WritePath> = controller.clone();
    let server = Arc::new(KvServer::new(engine.clone(), write_path, None));
    let kv_task = tokio::spawn(async move {
        if let Err(e) = server.run(kv_listener).await {
            error!("kv server failed: {}", e);
        }
    });

    info!(
        "cluster node {} serving kv on {}, replication on {}",
        node_id, kv_addr, repl_addr
    );
    Ok(NodeHandle {
        engine,
        kv_addr,
        repl_addr: Some(repl_addr),
        controller: Some(controller),
        tasks: vec![tick_task, repl_task, kv_task],
    })
}

/// Start a leaderless node, binding its own listeners.
pub async fn start_leaderless_node(config: LeaderlessNodeConfig) -> Result<NodeHandle, BoxError> {
    let kv_listener = TcpListener::bind(("127.0.0.1", config.kv_port)).await?;
    let repl_listener = TcpListener::bind(("127.0.0.1", config.repl_port)).await?;
    start_leaderless_node_on(config, kv_listener, repl_listener).await
}

/// Start a leaderless node on pre-bound listeners.
pub async fn start_leaderless_node_on(
    config: LeaderlessNodeConfig,
    kv_listener: TcpListener,
    repl_listener: TcpListener,
) -> Result<NodeHandle, BoxError> {
    let kv_addr = kv_listener.local_addr()?;
    let repl_addr = repl_listener.local_addr()?;

    let engine_config = EngineConfig::new(&config.data_dir, config.node_id);
    let engine = Arc::new(StateEngine::open(engine_config)?);

    let controller = Leaderless::new(engine.clone(), config.node_id, config.peer_repl_addrs);
    let mut tasks = controller.spawn_flushers();

    let handler: Arc<dyn PeerHandler> = controller.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = transport::serve(repl_listener, handler).await {
            error!("replication listener failed: {}", e);
        }
    }));

    let write_path: Arc<dyn WritePath> = controller;
    let server = Arc::new(KvServer::new(engine.clone(), write_path, None));
    tasks.push(tokio::spawn(async move {
        if let Err(e) = server.run(kv_listener).await {
            error!("kv server failed: {}", e);
        }
    }));

    info!(
        "leaderless node {} serving kv on {}, replication on {}",
        config.node_id, kv_addr, repl_addr
    );
    Ok(NodeHandle {
        engine,
        kv_addr,
        repl_addr: Some(repl_addr),
        controller: None,
        tasks,
    })
}
