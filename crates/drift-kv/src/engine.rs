//! State engine.
//!
//! Owns the record map and the durable sequence. All mutating paths post
//! jobs to a single writer thread which owns the WAL handle and the
//! snapshot store; that thread is the only code that appends, applies and
//! rotates files, so sequence numbers stay dense and apply order equals log
//! order. Readers take a read lock on the map and never wait on the writer
//! beyond the lock handoff.
//!
//! The conflict rule everywhere (replay, replication merge, normal writes)
//! is last-writer-wins on `(timestamp, origin)`.

use crate::error::{EngineError, StoreError};
use crate::snapshot::SnapshotStore;
use crate::types::{LogEntry, LogOp, NodeId, Record};
use crate::wal::{self, WalWriter};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

/// Receives post-apply notifications, in apply order.
///
/// Observers sit outside the durability path: they are only told about
/// mutations that actually won the conflict rule, and they must tolerate
/// being rebuilt from scratch by a full scan after recovery.
pub trait ApplyObserver: Send + Sync {
    /// `value` is `None` for deletions.
    fn on_apply(&self, key: &str, value: Option<&str>);
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Data directory holding `wal.log` and `snapshot.bin`.
    pub data_dir: PathBuf,

    /// This node's id; stamped into locally originated entries.
    pub node_id: NodeId,

    /// Snapshot after this many applied entries (default 1000).
    pub snapshot_every: u64,

    /// Probability that a `simulate_fail` snapshot skips persisting.
    pub snapshot_fail_probability: f64,

    /// Rotate the WAL after each successful snapshot. Left off in cluster
    /// modes, where gap-fill replays history from the log.
    pub truncate_wal_on_snapshot: bool,
}

impl EngineConfig {
    pub fn new(data_dir: impl Into<PathBuf>, node_id: NodeId) -> Self {
        Self {
            data_dir: data_dir.into(),
            node_id,
            snapshot_every: 1000,
            snapshot_fail_probability: 0.5,
            truncate_wal_on_snapshot: false,
        }
    }
}

/// What recovery found on startup.
#[derive(Debug, Default, Clone)]
pub struct RecoveryStats {
    pub snapshot_loaded: bool,
    pub snapshot_records: usize,
    pub wal_entries_replayed: usize,
    pub last_seq: u64,
}

struct Shared {
    map: RwLock<HashMap<String, Record>>,
    durable_seq: AtomicU64,
    observers: RwLock<Vec<Arc<dyn ApplyObserver>>>,
}

enum Job {
    /// WAL append only; the caller applies later (primary majority path).
    Append {
        entry: LogEntry,
        reply: oneshot::Sender<Result<u64, EngineError>>,
    },
    /// Apply an already-durable entry to the map.
    Apply {
        entry: LogEntry,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    /// Append + apply in one step.
    Commit {
        entry: LogEntry,
        reply: oneshot::Sender<Result<u64, EngineError>>,
    },
    Snapshot {
        simulate_fail: bool,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Shutdown,
}

/// Durable key-value state engine.
pub struct StateEngine {
    shared: Arc<Shared>,
    jobs: Sender<Job>,
    writer: Mutex<Option<JoinHandle<()>>>,
    config: EngineConfig,
    stats: RecoveryStats,
}

impl StateEngine {
    /// Open a data directory: load the snapshot, replay the WAL strictly
    /// after it, then start the writer thread.
    pub fn open(config: EngineConfig) -> Result<Self, EngineError> {
        let snapshots = SnapshotStore::new(&config.data_dir)
            .with_fail_probability(config.snapshot_fail_probability);

        let (mut map, snapshot_seq) = snapshots.load()?;
        let snapshot_records = map.len();

        // Opening the writer first truncates any torn tail, so the replay
        // below only sees well-formed entries.
        let wal = WalWriter::open(&config.data_dir, snapshot_seq)?;
        let replayed = wal::replay(&config.data_dir, snapshot_seq)?;
        for entry in &replayed {
            apply_entry(&mut map, entry);
        }

        let last_seq = wal.last_seq();
        let stats = RecoveryStats {
            snapshot_loaded: snapshot_seq > 0 || snapshot_records > 0,
            snapshot_records,
            wal_entries_replayed: replayed.len(),
            last_seq,
        };
        info!(
            "recovered {}: {} records from snapshot (seq {}), {} wal entries replayed, last seq {}",
            config.data_dir.display(),
            snapshot_records,
            snapshot_seq,
            replayed.len(),
            last_seq
        );

        let shared = Arc::new(Shared {
            map: RwLock::new(map),
            durable_seq: AtomicU64::new(last_seq),
            observers: RwLock::new(Vec::new()),
        });

        let (tx, rx) = crossbeam_channel::unbounded();
        let writer = Writer {
            shared: shared.clone(),
            wal,
            snapshots,
            config: config.clone(),
            entries_since_snapshot: 0,
            io_failures: 0,
        };
        let handle = std::thread::Builder::new()
            .name("drift-kv-writer".to_string())
            .spawn(move || writer.run(rx))
            .map_err(StoreError::Io)?;

        Ok(Self {
            shared,
            jobs: tx,
            writer: Mutex::new(Some(handle)),
            config,
            stats,
        })
    }

    fn submit<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, EngineError>>) -> Job,
    ) -> Result<oneshot::Receiver<Result<T, EngineError>>, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.jobs
            .send(build(reply))
            .map_err(|_| EngineError::Closed)?;
        Ok(rx)
    }

    /// Append the entry to the WAL (fsynced) and apply it to the map.
    pub async fn commit(&self, entry: LogEntry) -> Result<u64, EngineError> {
        let rx = self.submit(|reply| Job::Commit { entry, reply })?;
        rx.await.map_err(|_| EngineError::Closed)?
    }

    /// Append only. The entry is durable when this returns; apply it with
    /// [`StateEngine::apply_durable`] once replication allows.
    pub async fn append(&self, entry: LogEntry) -> Result<u64, EngineError> {
        let rx = self.submit(|reply| Job::Append { entry, reply })?;
        rx.await.map_err(|_| EngineError::Closed)?
    }

    /// Apply an entry that is already durable in the local WAL.
    pub async fn apply_durable(&self, entry: LogEntry) -> Result<(), EngineError> {
        let rx = self.submit(|reply| Job::Apply { entry, reply })?;
        rx.await.map_err(|_| EngineError::Closed)?
    }

    /// Force a snapshot at the current durable sequence.
    pub async fn snapshot_now(&self, simulate_fail: bool) -> Result<(), EngineError> {
        let rx = self.submit(|reply| Job::Snapshot {
            simulate_fail,
            reply,
        })?;
        rx.await.map_err(|_| EngineError::Closed)?
    }

    /// Current value for `key`; tombstones read as absent.
    pub fn get(&self, key: &str) -> Option<String> {
        let map = self.shared.map.read();
        map.get(key)
            .filter(|r| !r.tombstone)
            .map(|r| r.value.clone())
    }

    /// Highest sequence durable in the WAL.
    pub fn durable_seq(&self) -> u64 {
        self.shared.durable_seq.load(Ordering::SeqCst)
    }

    /// Number of visible (non-tombstone) records.
    pub fn len(&self) -> usize {
        self.shared.map.read().values().filter(|r| !r.tombstone).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    pub fn recovery_stats(&self) -> &RecoveryStats {
        &self.stats
    }

    /// Register an apply observer. Call before serving traffic, then seed it
    /// with [`StateEngine::for_each_visible`].
    pub fn register_observer(&self, observer: Arc<dyn ApplyObserver>) {
        self.shared.observers.write().push(observer);
    }

    /// Visit every visible record; used to rebuild observers after recovery.
    pub fn for_each_visible(&self, mut f: impl FnMut(&str, &str)) {
        let map = self.shared.map.read();
        for (key, record) in map.iter() {
            if !record.tombstone {
                f(key, &record.value);
            }
        }
    }

    /// Read WAL entries strictly after `seq`, oldest first. Drives gap-fill
    /// replication toward lagging peers.
    pub fn entries_after(&self, seq: u64) -> Result<Vec<LogEntry>, EngineError> {
        Ok(wal::replay(&self.config.data_dir, seq)?)
    }

    /// Drain the writer queue, write a final snapshot and stop the writer.
    pub async fn shutdown(&self) {
        let _ = self.jobs.send(Job::Shutdown);
        let handle = self.writer.lock().take();
        if let Some(handle) = handle {
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }
    }
}

/// Apply one entry to the map under LWW. Returns the accepted mutations as
/// `(key, new_value_or_none)` pairs, in apply order.
fn apply_entry(map: &mut HashMap<String, Record>, entry: &LogEntry) -> Vec<(String, Option<String>)> {
    let mut accepted = Vec::new();
    match &entry.op {
        LogOp::Set { key, value } => {
            apply_record(map, key, record_for(entry, value.clone(), false), &mut accepted);
        }
        LogOp::Delete { key } => {
            apply_record(map, key, record_for(entry, String::new(), true), &mut accepted);
        }
        LogOp::BulkSet { pairs } => {
            for (key, value) in pairs {
                apply_record(map, key, record_for(entry, value.clone(), false), &mut accepted);
            }
        }
    }
    accepted
}

fn record_for(entry: &LogEntry, value: String, tombstone: bool) -> Record {
    Record {
        value,
        timestamp: entry.timestamp,
        origin: entry.origin,
        tombstone,
    }
}

fn apply_record(
    map: &mut HashMap<String, Record>,
    key: &str,
    record: Record,
    accepted: &mut Vec<(String, Option<String>)>,
) {
    let wins = match map.get(key) {
        Some(existing) => record.supersedes(existing),
        None => true,
    };
    if wins {
        let note = if record.tombstone {
            None
        } else {
            Some(record.value.clone())
        };
        map.insert(key.to_string(), record);
        accepted.push((key.to_string(), note));
    }
}

/// Consecutive WAL IO failures tolerated before the node exits.
const MAX_CONSECUTIVE_IO_FAILURES: u32 = 3;

/// The single writer: owns the WAL handle and the snapshot store.
struct Writer {
    shared: Arc<Shared>,
    wal: WalWriter,
    snapshots: SnapshotStore,
    config: EngineConfig,
    entries_since_snapshot: u64,
    io_failures: u32,
}

impl Writer {
    fn run(mut self, jobs: Receiver<Job>) {
        while let Ok(job) = jobs.recv() {
            match job {
                Job::Append { mut entry, reply } => {
                    let _ = reply.send(self.append(&mut entry));
                }
                Job::Apply { entry, reply } => {
                    self.apply(&entry);
                    let _ = reply.send(Ok(()));
                }
                Job::Commit { mut entry, reply } => {
                    let result = self.append(&mut entry).map(|seq| {
                        self.apply(&entry);
                        seq
                    });
                    let _ = reply.send(result);
                }
                Job::Snapshot {
                    simulate_fail,
                    reply,
                } => {
                    let _ = reply.send(self.snapshot(simulate_fail));
                }
                Job::Shutdown => break,
            }
        }

        // Final snapshot on the way out; the queue is already drained
        // because jobs are processed in arrival order.
        if let Err(e) = self.snapshot(false) {
            error!("final snapshot failed: {}", e);
        }
    }

    fn append(&mut self, entry: &mut LogEntry) -> Result<u64, EngineError> {
        match self.wal.append(entry) {
            Ok(seq) => {
                self.io_failures = 0;
                self.shared.durable_seq.store(seq, Ordering::SeqCst);
                Ok(seq)
            }
            Err(e) => {
                if matches!(e, StoreError::Io(_)) {
                    self.io_failures += 1;
                    if self.io_failures >= MAX_CONSECUTIVE_IO_FAILURES {
                        error!(
                            "{} consecutive wal failures, shutting down: {}",
                            self.io_failures, e
                        );
                        std::process::exit(1);
                    }
                }
                Err(e.into())
            }
        }
    }

    fn apply(&mut self, entry: &LogEntry) {
        let accepted = {
            let mut map = self.shared.map.write();
            apply_entry(&mut map, entry)
        };

        if !accepted.is_empty() {
            let observers = self.shared.observers.read();
            for (key, value) in &accepted {
                for observer in observers.iter() {
                    observer.on_apply(key, value.as_deref());
                }
            }
        }

        self.entries_since_snapshot += 1;
        if self.entries_since_snapshot >= self.config.snapshot_every {
            if let Err(e) = self.snapshot(false) {
                warn!("periodic snapshot failed: {}", e);
            }
        }
    }

    fn snapshot(&mut self, simulate_fail: bool) -> Result<(), EngineError> {
        let (map, seq) = {
            let map = self.shared.map.read();
            (map.clone(), self.shared.durable_seq.load(Ordering::SeqCst))
        };
        self.snapshots.write(&map, seq, simulate_fail)?;
        self.entries_since_snapshot = 0;

        if self.config.truncate_wal_on_snapshot && !simulate_fail {
            self.wal.truncate_through(seq, seq)?;
        }
        Ok(())
    }
}
