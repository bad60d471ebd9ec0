//! Replication wire messages.
//!
//! Same line-delimited JSON framing as the client protocol, exchanged on
//! the repl-port. Every message gets exactly one reply on the connection.

use drift_kv::{LogEntry, NodeId};
use serde::{Deserialize, Serialize};

/// Messages sent to a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerMessage {
    /// Ship one log entry. In primary/secondary mode the term guards
    /// against stale leaders; leaderless mode sends term 0.
    AppendEntry { term: u64, entry: LogEntry },

    /// Leadership claim plus the primary's log position, every 150 ms.
    Heartbeat {
        term: u64,
        primary: NodeId,
        last_seq: u64,
    },

    /// Candidate asking for a vote.
    RequestVote {
        term: u64,
        candidate: NodeId,
        last_seq: u64,
    },
}

/// Replies, one per message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerReply {
    /// Ack for `AppendEntry`. `last_seq` lets the sender spot gaps.
    Append {
        term: u64,
        success: bool,
        last_seq: u64,
    },

    /// Ack for `Heartbeat`, advertising the receiver's log position so the
    /// primary can gap-fill.
    HeartbeatAck { term: u64, last_seq: u64 },

    /// Answer to `RequestVote`.
    Vote { term: u64, granted: bool },
}
