//! Primary/secondary replication controller.
//!
//! A role state machine with monotonic terms. The primary appends locally,
//! ships the entry to both secondaries in parallel and applies + acks only
//! after a strict majority (2 of 3, itself included) confirmed within the
//! deadline. Secondaries reject client writes, follow heartbeats and vote
//! in elections; a node that misses heartbeats for its randomized election
//! timeout campaigns for the next term.
//!
//! Safety rules: never accept an `AppendEntry` from a term lower than our
//! own; a primary that observes any higher term steps down immediately; a
//! vote is granted at most once per term and only to candidates whose log
//! is at least as long as ours.

use crate::cluster::message::{PeerMessage, PeerReply};
use crate::cluster::transport::{PeerClient, PeerHandler};
use crate::cluster::{ClusterNodeConfig, PeerInfo};
use crate::server::{WriteError, WritePath};
use async_trait::async_trait;
use drift_kv::{now_nanos, LogEntry, LogOp, NodeId, StateEngine};
use futures::future::join_all;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How often the primary announces itself.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(150);

/// Election timeout bounds; each cycle draws a fresh value in this range.
pub const ELECTION_TIMEOUT_MIN_MS: u64 = 800;
pub const ELECTION_TIMEOUT_MAX_MS: u64 = 1600;

/// How long the primary waits for a replication majority before failing a
/// write with `unavailable`.
pub const MAJORITY_TIMEOUT: Duration = Duration::from_millis(500);

/// Deadline for a single vote exchange.
const VOTE_TIMEOUT: Duration = Duration::from_millis(250);

/// Deadline for one heartbeat exchange.
const HEARTBEAT_TIMEOUT: Duration = Duration::from_millis(300);

/// Role-check granularity.
const TICK: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Secondary,
    Candidate,
}

struct RoleState {
    role: Role,
    term: u64,
    /// Term we last granted a vote in (including our own candidacies).
    voted_in: Option<u64>,
    known_primary: Option<NodeId>,
    /// For a secondary: last heartbeat received. For the primary: last
    /// heartbeat sent.
    last_heartbeat: Instant,
    election_timeout: Duration,
}

fn random_election_timeout() -> Duration {
    Duration::from_millis(
        rand::thread_rng().gen_range(ELECTION_TIMEOUT_MIN_MS..=ELECTION_TIMEOUT_MAX_MS),
    )
}

struct PeerSlot {
    info: PeerInfo,
    client: PeerClient,
    gap_filling: AtomicBool,
}

/// The controller. Shared between the KV server (write path), the repl
/// listener (peer handler) and its own tick loop.
pub struct PrimarySecondary {
    engine: Arc<StateEngine>,
    config: ClusterNodeConfig,
    state: Mutex<RoleState>,
    peers: Vec<PeerSlot>,
}

impl PrimarySecondary {
    pub fn new(engine: Arc<StateEngine>, config: ClusterNodeConfig) -> Arc<Self> {
        let peers = config
            .peers
            .iter()
            .map(|info| PeerSlot {
                info: info.clone(),
                client: PeerClient::new(info.repl_addr),
                gap_filling: AtomicBool::new(false),
            })
            .collect();

        Arc::new(Self {
            engine,
            config,
            state: Mutex::new(RoleState {
                role: Role::Secondary,
                term: 0,
                voted_in: None,
                known_primary: None,
                last_heartbeat: Instant::now(),
                election_timeout: random_election_timeout(),
            }),
            peers,
        })
    }

    pub fn role(&self) -> Role {
        self.state.lock().role
    }

    pub fn term(&self) -> u64 {
        self.state.lock().term
    }

    /// Start the heartbeat/election driver.
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.tick_loop().await })
    }

    async fn tick_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(TICK);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            enum Due {
                Heartbeat(u64),
                Election,
            }
            let due = {
                let st = self.state.lock();
                match st.role {
                    Role::Primary => {
                        if st.last_heartbeat.elapsed() >= HEARTBEAT_INTERVAL {
                            Some(Due::Heartbeat(st.term))
                        } else {
                            None
                        }
                    }
                    Role::Secondary => {
                        if st.last_heartbeat.elapsed() >= st.election_timeout {
                            Some(Due::Election)
                        } else {
                            None
                        }
                    }
                    Role::Candidate => None,
                }
            };

            match due {
                Some(Due::Heartbeat(term)) => self.broadcast_heartbeat(term).await,
                Some(Due::Election) => self.run_election().await,
                None => {}
            }
        }
    }

    async fn broadcast_heartbeat(self: &Arc<Self>, term: u64) {
        let last_seq = self.engine.durable_seq();
        {
            let mut st = self.state.lock();
            if st.role != Role::Primary || st.term != term {
                return;
            }
            st.last_heartbeat = Instant::now();
        }

        let message = PeerMessage::Heartbeat {
            term,
            primary: self.config.node_id,
            last_seq,
        };
        let replies = join_all(
            self.peers
                .iter()
                .map(|peer| peer.client.call(&message, HEARTBEAT_TIMEOUT)),
        )
        .await;

        for (peer, reply) in self.peers.iter().zip(replies) {
            match reply {
                Ok(PeerReply::HeartbeatAck {
                    term: peer_term,
                    last_seq: peer_seq,
                }) => {
                    if peer_term > term {
                        self.step_down(peer_term);
                        return;
                    }
                    if peer_seq < last_seq {
                        self.spawn_gap_fill(peer, peer_seq, term);
                    }
                }
                Ok(other) => warn!("unexpected heartbeat reply: {:?}", other),
                Err(e) => debug!("heartbeat to {} failed: {}", peer.info.repl_addr, e),
            }
        }
    }

    /// Re-send missing entries to a lagging secondary, one at a time in
    /// sequence order. At most one fill per peer runs at a time.
    fn spawn_gap_fill(self: &Arc<Self>, peer: &PeerSlot, from_seq: u64, term: u64) {
        if peer.gap_filling.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = self.clone();
        let peer_id = peer.info.node_id;
        tokio::spawn(async move {
            this.gap_fill(peer_id, from_seq, term).await;
        });
    }

    async fn gap_fill(self: Arc<Self>, peer_id: NodeId, from_seq: u64, term: u64) {
        let peer = match self.peers.iter().find(|p| p.info.node_id == peer_id) {
            Some(p) => p,
            None => return,
        };

        let entries = match self.engine.entries_after(from_seq) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("gap-fill read failed: {}", e);
                peer.gap_filling.store(false, Ordering::SeqCst);
                return;
            }
        };
        debug!(
            "gap-filling node {} with {} entries after seq {}",
            peer_id,
            entries.len(),
            from_seq
        );

        for entry in entries {
            if self.role() != Role::Primary {
                break;
            }
            let message = PeerMessage::AppendEntry {
                term,
                entry: entry.clone(),
            };
            match peer.client.call(&message, MAJORITY_TIMEOUT).await {
                Ok(PeerReply::Append { success: true, .. }) => {}
                Ok(PeerReply::Append {
                    term: peer_term, ..
                }) if peer_term > term => {
                    self.step_down(peer_term);
                    break;
                }
                _ => break,
            }
        }
        peer.gap_filling.store(false, Ordering::SeqCst);
    }

    async fn run_election(self: &Arc<Self>) {
        let (term, last_seq) = {
            let mut st = self.state.lock();
            if st.role != Role::Secondary || st.last_heartbeat.elapsed() < st.election_timeout {
                return;
            }
            st.role = Role::Candidate;
            st.term += 1;
            st.voted_in = Some(st.term);
            st.known_primary = None;
            st.last_heartbeat = Instant::now();
            st.election_timeout = random_election_timeout();
            (st.term, self.engine.durable_seq())
        };
        info!(
            "node {} starting election for term {} (last seq {})",
            self.config.node_id, term, last_seq
        );

        let message = PeerMessage::RequestVote {
            term,
            candidate: self.config.node_id,
            last_seq,
        };
        let replies = join_all(
            self.peers
                .iter()
                .map(|peer| peer.client.call(&message, VOTE_TIMEOUT)),
        )
        .await;

        let mut granted = 1usize; // our own vote
        let mut highest_term = term;
        for reply in replies.into_iter().flatten() {
            if let PeerReply::Vote {
                term: vote_term,
                granted: vote_granted,
            } = reply
            {
                highest_term = highest_term.max(vote_term);
                if vote_granted && vote_term == term {
                    granted += 1;
                }
            }
        }

        if highest_term > term {
            self.step_down(highest_term);
            return;
        }

        let won = {
            let mut st = self.state.lock();
            if st.role != Role::Candidate || st.term != term {
                false
            } else if granted >= self.majority() {
                st.role = Role::Primary;
                st.known_primary = Some(self.config.node_id);
                st.last_heartbeat = Instant::now();
                true
            } else {
                st.role = Role::Secondary;
                st.last_heartbeat = Instant::now();
                st.election_timeout = random_election_timeout();
                false
            }
        };

        if won {
            info!(
                "node {} became primary for term {} with {} votes",
                self.config.node_id, term, granted
            );
            self.broadcast_heartbeat(term).await;
        } else {
            debug!(
                "node {} lost election for term {} ({} votes)",
                self.config.node_id, term, granted
            );
        }
    }

    fn step_down(&self, observed_term: u64) {
        let mut st = self.state.lock();
        if observed_term > st.term {
            st.term = observed_term;
            st.voted_in = None;
            st.known_primary = None;
        }
        if st.role != Role::Secondary {
            info!(
                "node {} stepping down to secondary at term {}",
                self.config.node_id, st.term
            );
        }
        st.role = Role::Secondary;
        st.last_heartbeat = Instant::now();
        st.election_timeout = random_election_timeout();
    }

    /// Strict majority of the cluster, this node included.
    fn majority(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    fn kv_port_of(&self, node_id: NodeId) -> Option<u16> {
        if node_id == self.config.node_id {
            return Some(self.config.kv_port);
        }
        self.config
            .peers
            .iter()
            .find(|p| p.node_id == node_id)
            .and_then(|p| p.kv_port)
    }

    async fn handle_append(&self, term: u64, entry: LogEntry) -> PeerReply {
        {
            let mut st = self.state.lock();
            if term < st.term {
                return PeerReply::Append {
                    term: st.term,
                    success: false,
                    last_seq: self.engine.durable_seq(),
                };
            }
            if term == st.term && st.role == Role::Primary {
                // Two primaries in one term would be a protocol violation;
                // refuse rather than follow.
                return PeerReply::Append {
                    term: st.term,
                    success: false,
                    last_seq: self.engine.durable_seq(),
                };
            }
            if term > st.term {
                st.term = term;
                st.voted_in = None;
            }
            st.role = Role::Secondary;
            st.last_heartbeat = Instant::now();
        }

        let local_seq = self.engine.durable_seq();
        if entry.seq != 0 && entry.seq <= local_seq {
            // Already durable here; re-apply is harmless under LWW.
            let _ = self.engine.apply_durable(entry).await;
            return PeerReply::Append {
                term,
                success: true,
                last_seq: self.engine.durable_seq(),
            };
        }

        match self.engine.append(entry.clone()).await {
            Ok(seq) => {
                let mut applied = entry;
                applied.seq = seq;
                let _ = self.engine.apply_durable(applied).await;
                PeerReply::Append {
                    term,
                    success: true,
                    last_seq: seq,
                }
            }
            Err(e) if e.is_sequence_gap() => PeerReply::Append {
                term,
                success: false,
                last_seq: local_seq,
            },
            Err(e) => {
                warn!("replicated append failed: {}", e);
                PeerReply::Append {
                    term,
                    success: false,
                    last_seq: local_seq,
                }
            }
        }
    }

    fn handle_heartbeat(&self, term: u64, primary: NodeId) -> PeerReply {
        let mut st = self.state.lock();
        if term < st.term {
            return PeerReply::HeartbeatAck {
                term: st.term,
                last_seq: self.engine.durable_seq(),
            };
        }
        if term > st.term {
            st.term = term;
            st.voted_in = None;
        }
        if primary != self.config.node_id {
            st.role = Role::Secondary;
            st.known_primary = Some(primary);
        }
        st.last_heartbeat = Instant::now();

        PeerReply::HeartbeatAck {
            term: st.term,
            last_seq: self.engine.durable_seq(),
        }
    }

    fn handle_request_vote(&self, term: u64, candidate: NodeId, last_seq: u64) -> PeerReply {
        let mut st = self.state.lock();
        if term < st.term {
            return PeerReply::Vote {
                term: st.term,
                granted: false,
            };
        }
        if term > st.term {
            st.term = term;
            st.voted_in = None;
            st.role = Role::Secondary;
            st.known_primary = None;
        }

        let up_to_date = last_seq >= self.engine.durable_seq();
        let granted = st.voted_in.is_none() && up_to_date;
        if granted {
            st.voted_in = Some(term);
            st.last_heartbeat = Instant::now();
            st.election_timeout = random_election_timeout();
            debug!(
                "node {} voting for {} in term {}",
                self.config.node_id, candidate, term
            );
        }

        PeerReply::Vote {
            term: st.term,
            granted,
        }
    }
}

#[async_trait]
impl PeerHandler for PrimarySecondary {
    async fn handle(&self, message: PeerMessage) -> PeerReply {
        match message {
            PeerMessage::AppendEntry { term, entry } => self.handle_append(term, entry).await,
            PeerMessage::Heartbeat { term, primary, .. } => self.handle_heartbeat(term, primary),
            PeerMessage::RequestVote {
                term,
                candidate,
                last_seq,
            } => self.handle_request_vote(term, candidate, last_seq),
        }
    }
}

#[async_trait]
impl WritePath for PrimarySecondary {
    async fn submit(&self, op: LogOp) -> Result<(), WriteError> {
        let term = {
            let st = self.state.lock();
            if st.role != Role::Primary {
                let hint = st.known_primary.and_then(|id| self.kv_port_of(id));
                return Err(WriteError::NotPrimary {
                    primary_kv_port: hint,
                });
            }
            st.term
        };

        let mut entry = LogEntry::new(self.config.node_id, now_nanos(), op);
        let seq = self.engine.append(entry.clone()).await?;
        entry.seq = seq;

        // The engine lock is not held here: the append job completed, and
        // the apply below is a separate job after the majority wait.
        let message = PeerMessage::AppendEntry {
            term,
            entry: entry.clone(),
        };
        let replies = join_all(
            self.peers
                .iter()
                .map(|peer| peer.client.call(&message, MAJORITY_TIMEOUT)),
        )
        .await;

        let mut acks = 1usize; // local WAL counts
        let mut highest_term = term;
        for reply in replies.into_iter().flatten() {
            if let PeerReply::Append {
                term: peer_term,
                success,
                ..
            } = reply
            {
                highest_term = highest_term.max(peer_term);
                if success {
                    acks += 1;
                }
            }
        }

        if highest_term > term {
            self.step_down(highest_term);
            return Err(WriteError::Unavailable);
        }
        if acks < self.majority() {
            // The entry stays durable in our WAL; heartbeat-driven
            // gap-fill delivers it once peers come back.
            return Err(WriteError::Unavailable);
        }

        self.engine.apply_durable(entry).await?;
        Ok(())
    }
}
