//! Durable key-value engine for drift.
//!
//! # Architecture
//!
//! - **WAL**: append-only log, fsynced before every acknowledgment
//! - **Snapshots**: periodic full-map images for fast recovery
//! - **State engine**: in-memory map behind an explicit single-writer queue
//! - **Recovery**: load snapshot + replay the WAL delta
//!
//! All mutations flow through one writer thread, which keeps sequence
//! numbers dense and makes the WAL the single source of truth on restart.
//! Conflict resolution is last-writer-wins on (timestamp, origin node id),
//! the same rule the leaderless replication mode merges with.

pub mod engine;
pub mod error;
pub mod snapshot;
pub mod types;
pub mod wal;

pub use engine::{ApplyObserver, EngineConfig, RecoveryStats, StateEngine};
pub use error::{EngineError, StoreError};
pub use types::{now_nanos, LogEntry, LogOp, NodeId, Record, SEQ_UNASSIGNED};
