//! Peer-to-peer transport.
//!
//! Inbound: a listener on the repl-port accepts connections in parallel and
//! answers each message line with one reply line. Outbound: one persistent
//! connection per peer, re-established with exponential backoff after a
//! failure (100 ms doubling to a 2 s cap). Per-call deadlines live here so
//! a timed-out exchange also tears the connection down instead of leaving a
//! half-read stream behind.

use crate::cluster::message::{PeerMessage, PeerReply};
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tracing::{debug, warn};

/// First reconnect delay after a peer failure.
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Reconnect delay cap.
pub const MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Replication frames carry whole log entries; allow more headroom than the
/// client line cap.
const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Answers inbound peer messages. Implemented by both controllers.
#[async_trait]
pub trait PeerHandler: Send + Sync {
    async fn handle(&self, message: PeerMessage) -> PeerReply;
}

/// Accept and serve peer connections until the listener fails.
pub async fn serve(listener: TcpListener, handler: Arc<dyn PeerHandler>) -> io::Result<()> {
    loop {
        let (socket, peer_addr) = listener.accept().await?;
        let handler = handler.clone();

        tokio::spawn(async move {
            if let Err(e) = serve_connection(socket, handler).await {
                debug!("peer connection from {} ended: {}", peer_addr, e);
            }
        });
    }
}

async fn serve_connection(socket: TcpStream, handler: Arc<dyn PeerHandler>) -> io::Result<()> {
    socket.set_nodelay(true)?;
    let (read_half, mut write_half) = socket.into_split();
    let mut reader = BufReader::new(read_half);

    loop {
        let line = match read_line(&mut reader).await? {
            Some(line) => line,
            None => return Ok(()),
        };
        let message: PeerMessage = match serde_json::from_slice(&line) {
            Ok(m) => m,
            Err(e) => {
                warn!("malformed peer message: {}", e);
                return Ok(());
            }
        };

        let reply = handler.handle(message).await;
        let mut out = serde_json::to_vec(&reply)?;
        out.push(b'\n');
        write_half.write_all(&out).await?;
        write_half.flush().await?;
    }
}

async fn read_line(reader: &mut BufReader<OwnedReadHalf>) -> io::Result<Option<Vec<u8>>> {
    let mut line = Vec::new();
    let mut limited = reader.take((MAX_FRAME_BYTES + 1) as u64);
    let n = limited.read_until(b'\n', &mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    if line.len() > MAX_FRAME_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "peer frame exceeds size cap",
        ));
    }
    Ok(Some(line))
}

struct PeerConn {
    stream: Option<(BufReader<OwnedReadHalf>, OwnedWriteHalf)>,
    backoff: Duration,
    retry_at: Option<Instant>,
}

/// Outbound connection to one peer.
pub struct PeerClient {
    addr: SocketAddr,
    conn: tokio::sync::Mutex<PeerConn>,
}

impl PeerClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            conn: tokio::sync::Mutex::new(PeerConn {
                stream: None,
                backoff: INITIAL_BACKOFF,
                retry_at: None,
            }),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Send one message and wait for its reply, bounded by `deadline`.
    ///
    /// Any failure (connect, IO, deadline) drops the connection and arms
    /// the backoff; calls arriving before the backoff expires fail fast
    /// without touching the network.
    pub async fn call(&self, message: &PeerMessage, deadline: Duration) -> io::Result<PeerReply> {
        let mut conn = self.conn.lock().await;

        if conn.stream.is_none() {
            if let Some(at) = conn.retry_at {
                if Instant::now() < at {
                    return Err(io::Error::new(
                        io::ErrorKind::ConnectionRefused,
                        "peer in reconnect backoff",
                    ));
                }
            }
            match tokio::time::timeout(deadline, TcpStream::connect(self.addr)).await {
                Ok(Ok(socket)) => {
                    socket.set_nodelay(true)?;
                    let (read_half, write_half) = socket.into_split();
                    conn.stream = Some((BufReader::new(read_half), write_half));
                    conn.backoff = INITIAL_BACKOFF;
                    conn.retry_at = None;
                }
                Ok(Err(e)) => {
                    Self::arm_backoff(&mut conn);
                    return Err(e);
                }
                Err(_) => {
                    Self::arm_backoff(&mut conn);
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out"));
                }
            }
        }

        let result = tokio::time::timeout(deadline, Self::exchange(&mut conn, message)).await;
        match result {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => {
                conn.stream = None;
                Self::arm_backoff(&mut conn);
                Err(e)
            }
            Err(_) => {
                // A timed-out exchange leaves the stream mid-frame; it
                // cannot be reused.
                conn.stream = None;
                Self::arm_backoff(&mut conn);
                Err(io::Error::new(io::ErrorKind::TimedOut, "peer call timed out"))
            }
        }
    }

    fn arm_backoff(conn: &mut PeerConn) {
        conn.retry_at = Some(Instant::now() + conn.backoff);
        conn.backoff = (conn.backoff * 2).min(MAX_BACKOFF);
    }

    async fn exchange(conn: &mut PeerConn, message: &PeerMessage) -> io::Result<PeerReply> {
        let (reader, writer) = conn
            .stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no peer connection"))?;

        let mut out = serde_json::to_vec(message)?;
        out.push(b'\n');
        writer.write_all(&out).await?;
        writer.flush().await?;

        let mut line = Vec::new();
        let mut limited = reader.take((MAX_FRAME_BYTES + 1) as u64);
        let n = limited.read_until(b'\n', &mut line).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed mid-exchange",
            ));
        }
        if line.len() > MAX_FRAME_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "peer reply exceeds size cap",
            ));
        }

        serde_json::from_slice(&line)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}
