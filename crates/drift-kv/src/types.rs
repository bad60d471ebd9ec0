//! Core data types shared by the engine, the log and the replication plane.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Node identifier within a cluster. 0 is reserved for single-node operation.
pub type NodeId = u32;

/// Sequence value meaning "not yet assigned"; real sequences start at 1.
pub const SEQ_UNASSIGNED: u64 = 0;

/// Wall-clock nanoseconds since the Unix epoch.
///
/// Used only for record timestamps (last-writer-wins ordering); elapsed-time
/// checks elsewhere use a monotonic clock.
pub fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// A stored record. Deletions keep the record around as a tombstone so the
/// timestamp stays available for conflict resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub value: String,
    /// Wall-clock nanoseconds at the originating node.
    pub timestamp: u64,
    /// Node that produced the write.
    pub origin: NodeId,
    pub tombstone: bool,
}

impl Record {
    /// Version key for last-writer-wins ordering: timestamp first, origin
    /// node id as the tie-break.
    pub fn version(&self) -> (u64, NodeId) {
        (self.timestamp, self.origin)
    }

    /// Whether this record replaces `other` under LWW. Replacement requires
    /// a strictly greater version; equal versions keep the stored record.
    pub fn supersedes(&self, other: &Record) -> bool {
        self.version() > other.version()
    }
}

/// Mutation kinds carried by the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogOp {
    Set { key: String, value: String },
    Delete { key: String },
    /// All pairs become visible together or not at all: the whole batch is
    /// one log entry behind a single fsync.
    BulkSet { pairs: Vec<(String, String)> },
}

impl LogOp {
    pub fn kind(&self) -> &'static str {
        match self {
            LogOp::Set { .. } => "set",
            LogOp::Delete { .. } => "delete",
            LogOp::BulkSet { .. } => "bulkset",
        }
    }
}

/// A write-ahead log entry. `seq` is dense and per-node; replicated entries
/// keep their origin node id and timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub seq: u64,
    pub origin: NodeId,
    pub timestamp: u64,
    pub op: LogOp,
}

impl LogEntry {
    /// Build an entry with an unassigned sequence; the WAL assigns one on
    /// append.
    pub fn new(origin: NodeId, timestamp: u64, op: LogOp) -> Self {
        Self {
            seq: SEQ_UNASSIGNED,
            origin,
            timestamp,
            op,
        }
    }
}
