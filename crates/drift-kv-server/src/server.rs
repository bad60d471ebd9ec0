//! TCP server implementation.
//!
//! Each connection is handled on its own task; requests on one connection
//! are processed strictly in arrival order, so pipelined clients get their
//! responses back in order. Reads go straight to the engine; writes are
//! routed through the mode-specific [`WritePath`].

use crate::index::Indexes;
use crate::protocol::{
    read_request, write_response, ErrorCode, ProtocolError, Request, Response, SearchMatch,
};
use async_trait::async_trait;
use drift_kv::{now_nanos, EngineError, LogEntry, LogOp, StateEngine};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, warn};

/// Outcome of a rejected or failed write.
#[derive(Error, Debug)]
pub enum WriteError {
    #[error("this node is not the primary")]
    NotPrimary { primary_kv_port: Option<u16> },

    #[error("no replication majority within the deadline")]
    Unavailable,

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Narrow seam between the server and the replication controller: the
/// server submits mutations, the controller decides what durability and
/// fan-out mean in its mode.
#[async_trait]
pub trait WritePath: Send + Sync {
    async fn submit(&self, op: LogOp) -> Result<(), WriteError>;
}

/// Write path for single-node operation: local WAL durability is the whole
/// story.
pub struct LocalWritePath {
    engine: Arc<StateEngine>,
}

impl LocalWritePath {
    pub fn new(engine: Arc<StateEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl WritePath for LocalWritePath {
    async fn submit(&self, op: LogOp) -> Result<(), WriteError> {
        let entry = LogEntry::new(self.engine.node_id(), now_nanos(), op);
        self.engine.commit(entry).await?;
        Ok(())
    }
}

/// KV server.
pub struct KvServer {
    engine: Arc<StateEngine>,
    write_path: Arc<dyn WritePath>,
    indexes: Option<Arc<Indexes>>,
}

impl KvServer {
    pub fn new(
        engine: Arc<StateEngine>,
        write_path: Arc<dyn WritePath>,
        indexes: Option<Arc<Indexes>>,
    ) -> Self {
        Self {
            engine,
            write_path,
            indexes,
        }
    }

    /// Accept connections until the listener fails.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (socket, peer_addr) = listener.accept().await?;
            let server = self.clone();

            tokio::spawn(async move {
                debug!("new connection from {}", peer_addr);
                if let Err(e) = server.handle_connection(socket).await {
                    warn!("connection error from {}: {}", peer_addr, e);
                }
                debug!("connection closed: {}", peer_addr);
            });
        }
    }

    async fn handle_connection(&self, socket: TcpStream) -> std::io::Result<()> {
        socket.set_nodelay(true)?;
        let (read_half, mut write_half) = socket.into_split();
        let mut reader = BufReader::new(read_half);

        loop {
            match read_request(&mut reader).await {
                Ok(None) => return Ok(()),
                Ok(Some(request)) => {
                    let response = self.dispatch(request).await;
                    write_response(&mut write_half, &response).await?;
                }
                Err(ProtocolError::Io(e)) => return Err(e),
                Err(e) => {
                    // Malformed input poisons the stream; answer once and
                    // close.
                    debug!("protocol error: {}", e);
                    let _ =
                        write_response(&mut write_half, &Response::error(ErrorCode::Protocol))
                            .await;
                    return Ok(());
                }
            }
        }
    }

    async fn dispatch(&self, request: Request) -> Response {
        match request {
            Request::Get { key } => match self.engine.get(&key) {
                Some(value) => Response::with_value(value),
                None => Response::not_found(),
            },
            Request::Set {
                key,
                value,
                debug_simulate_fail,
            } => {
                self.write(LogOp::Set { key, value }, debug_simulate_fail)
                    .await
            }
            Request::Delete { key } => self.write(LogOp::Delete { key }, false).await,
            Request::Bulkset {
                pairs,
                debug_simulate_fail,
            } => self.write(LogOp::BulkSet { pairs }, debug_simulate_fail).await,
            Request::Search { query } => match &self.indexes {
                Some(indexes) => Response::with_keys(indexes.text.search(&query)),
                None => Response::error(ErrorCode::IndexesDisabled),
            },
            Request::SearchSimilar { query, top_k } => match &self.indexes {
                Some(indexes) => Response::with_matches(
                    indexes
                        .similar
                        .search(&query, top_k)
                        .into_iter()
                        .map(|(key, score)| SearchMatch { key, score })
                        .collect(),
                ),
                None => Response::error(ErrorCode::IndexesDisabled),
            },
        }
    }

    async fn write(&self, op: LogOp, debug_simulate_fail: bool) -> Response {
        match self.write_path.submit(op).await {
            Ok(()) => {
                if debug_simulate_fail {
                    // The write is durable; the snapshot attempt may
                    // silently skip persisting, modelling a crash before
                    // the snapshot hit disk.
                    if let Err(e) = self.engine.snapshot_now(true).await {
                        warn!("debug snapshot failed: {}", e);
                    }
                }
                Response::ok()
            }
            Err(WriteError::NotPrimary { primary_kv_port }) => {
                Response::not_primary(primary_kv_port)
            }
            Err(WriteError::Unavailable) => Response::error(ErrorCode::Unavailable),
            Err(WriteError::Engine(e)) => {
                error!("write failed: {}", e);
                Response::error(ErrorCode::Io)
            }
        }
    }
}
