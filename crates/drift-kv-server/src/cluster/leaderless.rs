//! Leaderless replication controller.
//!
//! Every node accepts writes. A write is acked after local WAL durability;
//! replication to peers is best-effort through bounded per-peer outbound
//! queues drained by one flusher task each. Incoming entries are
//! re-sequenced into the local log and merged under last-writer-wins, so
//! all nodes converge on the record with the greatest
//! `(timestamp, origin)` once traffic settles.

use crate::cluster::message::{PeerMessage, PeerReply};
use crate::cluster::transport::{PeerClient, PeerHandler, INITIAL_BACKOFF};
use crate::server::{WriteError, WritePath};
use async_trait::async_trait;
use drift_kv::{now_nanos, LogEntry, LogOp, NodeId, StateEngine, SEQ_UNASSIGNED};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, warn};

/// Entries buffered per unreachable peer before the oldest are dropped.
pub const OUTBOUND_QUEUE_CAP: usize = 10_000;

/// Deadline for shipping one entry to a peer.
const SEND_TIMEOUT: Duration = Duration::from_millis(500);

/// Outbound buffer toward one peer.
pub struct PeerOutbox {
    client: PeerClient,
    queue: Mutex<VecDeque<LogEntry>>,
    notify: Notify,
    dropped: AtomicU64,
}

impl PeerOutbox {
    fn new(addr: SocketAddr) -> Self {
        Self {
            client: PeerClient::new(addr),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue, dropping the oldest entry when the buffer is full.
    fn push(&self, entry: LogEntry) {
        {
            let mut queue = self.queue.lock();
            if queue.len() >= OUTBOUND_QUEUE_CAP {
                queue.pop_front();
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    peer = %self.client.addr(),
                    total_dropped = total,
                    "replication_lag_dropped"
                );
            }
            queue.push_back(entry);
        }
        self.notify.notify_one();
    }

    /// Entries dropped from this buffer so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn depth(&self) -> usize {
        self.queue.lock().len()
    }
}

/// The controller: one outbox per peer plus the local engine.
pub struct Leaderless {
    engine: Arc<StateEngine>,
    node_id: NodeId,
    peers: Vec<Arc<PeerOutbox>>,
}

impl Leaderless {
    pub fn new(engine: Arc<StateEngine>, node_id: NodeId, peer_addrs: Vec<SocketAddr>) -> Arc<Self> {
        let peers = peer_addrs
            .into_iter()
            .map(|addr| Arc::new(PeerOutbox::new(addr)))
            .collect();
        Arc::new(Self {
            engine,
            node_id,
            peers,
        })
    }

    /// Start one flusher task per peer.
    pub fn spawn_flushers(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        self.peers
            .iter()
            .map(|outbox| {
                let outbox = outbox.clone();
                tokio::spawn(async move { flush_loop(outbox).await })
            })
            .collect()
    }

    pub fn outboxes(&self) -> &[Arc<PeerOutbox>] {
        &self.peers
    }
}

async fn flush_loop(outbox: Arc<PeerOutbox>) {
    loop {
        let entry = loop {
            let head = outbox.queue.lock().front().cloned();
            match head {
                Some(entry) => break entry,
                None => outbox.notify.notified().await,
            }
        };

        let message = PeerMessage::AppendEntry {
            term: 0,
            entry: entry.clone(),
        };
        match outbox.client.call(&message, SEND_TIMEOUT).await {
            Ok(_) => {
                let mut queue = outbox.queue.lock();
                // The head may have been dropped by an overflow while the
                // send was in flight; only pop if it is still our entry.
                if queue
                    .front()
                    .map(|head| head.seq == entry.seq && head.origin == entry.origin)
                    .unwrap_or(false)
                {
                    queue.pop_front();
                }
            }
            Err(e) => {
                debug!(peer = %outbox.client.addr(), "replication send failed: {}", e);
                // The client arms its own reconnect backoff; this sleep just
                // keeps the loop from spinning against it.
                tokio::time::sleep(INITIAL_BACKOFF).await;
            }
        }
    }
}

#[async_trait]
impl WritePath for Leaderless {
    async fn submit(&self, op: LogOp) -> Result<(), WriteError> {
        let mut entry = LogEntry::new(self.node_id, now_nanos(), op);
        let seq = self.engine.commit(entry.clone()).await?;
        entry.seq = seq;

        // Client ack does not wait for peers.
        for peer in &self.peers {
            peer.push(entry.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl PeerHandler for Leaderless {
    async fn handle(&self, message: PeerMessage) -> PeerReply {
        match message {
            PeerMessage::AppendEntry { entry, .. } => {
                // Re-sequence into the local log; LWW decides visibility.
                let mut local = entry;
                local.seq = SEQ_UNASSIGNED;
                match self.engine.commit(local).await {
                    Ok(seq) => PeerReply::Append {
                        term: 0,
                        success: true,
                        last_seq: seq,
                    },
                    Err(e) => {
                        error!("merge of replicated entry failed: {}", e);
                        PeerReply::Append {
                            term: 0,
                            success: false,
                            last_seq: self.engine.durable_seq(),
                        }
                    }
                }
            }
            PeerMessage::Heartbeat { .. } => PeerReply::HeartbeatAck {
                term: 0,
                last_seq: self.engine.durable_seq(),
            },
            PeerMessage::RequestVote { .. } => PeerReply::Vote {
                term: 0,
                granted: false,
            },
        }
    }
}
