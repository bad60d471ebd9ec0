//! Engine and persistence error types.

use thiserror::Error;

/// Errors raised by the WAL and snapshot layers.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("corrupted wal entry at offset {offset}: {reason}")]
    CorruptedWal { offset: u64, reason: String },

    #[error("checksum mismatch at offset {offset}: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        offset: u64,
        expected: u32,
        actual: u32,
    },

    #[error("sequence gap: expected {expected}, got {got}")]
    SequenceGap { expected: u64, got: u64 },

    #[error("cannot truncate through {seq}: durable snapshot only covers {snapshot_seq}")]
    TruncateDenied { seq: u64, snapshot_seq: u64 },
}

/// Errors surfaced by the state engine.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("engine is shut down")]
    Closed,
}

impl EngineError {
    /// True when a replicated append arrived ahead of the local log; the
    /// sender is expected to gap-fill from an earlier sequence.
    pub fn is_sequence_gap(&self) -> bool {
        matches!(self, EngineError::Store(StoreError::SequenceGap { .. }))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
