//! Snapshot store.
//!
//! A snapshot is an atomic point-in-time image of the whole record map:
//!
//! ```text
//! [Seq:8 | CRC32:4 | bincode map]
//! ```
//!
//! Written to `snapshot.tmp`, fsynced, renamed over `snapshot.bin`, then the
//! directory is fsynced, so the canonical file is always either the old or
//! the new complete image. A missing or corrupt snapshot degrades to
//! "empty map, seq 0" and recovery falls back to replaying the WAL from the
//! beginning.

use crate::error::Result;
use crate::types::Record;
use crc32fast::Hasher;
use rand::Rng;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Canonical snapshot file name inside a data directory.
pub const SNAPSHOT_FILE: &str = "snapshot.bin";

/// Transient file used while writing a new snapshot.
pub const SNAPSHOT_TMP_FILE: &str = "snapshot.tmp";

fn crc32(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Reads and writes the snapshot files of one data directory.
pub struct SnapshotStore {
    dir: PathBuf,
    fail_probability: f64,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            fail_probability: 0.5,
        }
    }

    /// Probability that a `simulate_fail` write silently skips persisting.
    pub fn with_fail_probability(mut self, p: f64) -> Self {
        self.fail_probability = p.clamp(0.0, 1.0);
        self
    }

    /// Serialize the full map at `seq` and atomically replace the canonical
    /// snapshot.
    ///
    /// With `simulate_fail` set, the write pretends to succeed without
    /// touching disk with the configured probability. This models a crash
    /// before the snapshot reached storage; the WAL is never subject to it,
    /// so recovery re-applies the lost delta.
    pub fn write(
        &self,
        map: &HashMap<String, Record>,
        seq: u64,
        simulate_fail: bool,
    ) -> Result<()> {
        if simulate_fail && rand::thread_rng().gen_bool(self.fail_probability) {
            debug!("snapshot at seq {} skipped by simulated failure", seq);
            return Ok(());
        }

        fs::create_dir_all(&self.dir)?;
        let payload = bincode::serialize(map)?;
        let tmp_path = self.dir.join(SNAPSHOT_TMP_FILE);
        let final_path = self.dir.join(SNAPSHOT_FILE);

        let mut file = File::create(&tmp_path)?;
        file.write_all(&seq.to_be_bytes())?;
        file.write_all(&crc32(&payload).to_be_bytes())?;
        file.write_all(&payload)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp_path, &final_path)?;
        File::open(&self.dir)?.sync_all()?;

        debug!("snapshot written: {} records at seq {}", map.len(), seq);
        Ok(())
    }

    /// Load the canonical snapshot.
    ///
    /// Missing file, short header, checksum failure or an undecodable map
    /// all degrade to `(empty, 0)` — the WAL is authoritative and replay
    /// from zero reconstructs the state.
    pub fn load(&self) -> Result<(HashMap<String, Record>, u64)> {
        let path = self.dir.join(SNAPSHOT_FILE);
        let mut file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok((HashMap::new(), 0))
            }
            Err(e) => return Err(e.into()),
        };

        let mut header = [0u8; 12];
        if let Err(e) = file.read_exact(&mut header) {
            warn!("snapshot {} unreadable ({}), ignoring", path.display(), e);
            return Ok((HashMap::new(), 0));
        }
        let seq = u64::from_be_bytes(header[0..8].try_into().unwrap_or([0u8; 8]));
        let expected = u32::from_be_bytes(header[8..12].try_into().unwrap_or([0u8; 4]));

        let mut payload = Vec::new();
        file.read_to_end(&mut payload)?;

        let actual = crc32(&payload);
        if actual != expected {
            warn!(
                "snapshot {} failed checksum (expected {:08x}, got {:08x}), ignoring",
                path.display(),
                expected,
                actual
            );
            return Ok((HashMap::new(), 0));
        }

        match bincode::deserialize(&payload) {
            Ok(map) => Ok((map, seq)),
            Err(e) => {
                warn!("snapshot {} undecodable ({}), ignoring", path.display(), e);
                Ok((HashMap::new(), 0))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_map() -> HashMap<String, Record> {
        let mut map = HashMap::new();
        map.insert(
            "alpha".to_string(),
            Record {
                value: "1".to_string(),
                timestamp: 100,
                origin: 1,
                tombstone: false,
            },
        );
        map.insert(
            "beta".to_string(),
            Record {
                value: String::new(),
                timestamp: 200,
                origin: 2,
                tombstone: true,
            },
        );
        map
    }

    #[test]
    fn test_write_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path());

        let map = sample_map();
        store.write(&map, 42, false).unwrap();

        let (loaded, seq) = store.load().unwrap();
        assert_eq!(seq, 42);
        assert_eq!(loaded, map);
    }

    #[test]
    fn test_missing_snapshot_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path());

        let (map, seq) = store.load().unwrap();
        assert!(map.is_empty());
        assert_eq!(seq, 0);
    }

    #[test]
    fn test_corrupt_snapshot_falls_back_to_empty() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path());
        store.write(&sample_map(), 7, false).unwrap();

        // Flip a payload byte.
        let path = dir.path().join(SNAPSHOT_FILE);
        let mut data = fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        fs::write(&path, &data).unwrap();

        let (map, seq) = store.load().unwrap();
        assert!(map.is_empty());
        assert_eq!(seq, 0);
    }

    #[test]
    fn test_rewrite_replaces_previous() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path());

        store.write(&sample_map(), 10, false).unwrap();
        let mut newer = sample_map();
        newer.remove("beta");
        store.write(&newer, 20, false).unwrap();

        let (map, seq) = store.load().unwrap();
        assert_eq!(seq, 20);
        assert_eq!(map, newer);
        assert!(!dir.path().join(SNAPSHOT_TMP_FILE).exists());
    }

    #[test]
    fn test_simulated_failure_persists_nothing() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path()).with_fail_probability(1.0);

        store.write(&sample_map(), 5, true).unwrap();
        assert!(!dir.path().join(SNAPSHOT_FILE).exists());

        // The switch only bites when simulate_fail is requested.
        store.write(&sample_map(), 5, false).unwrap();
        assert!(dir.path().join(SNAPSHOT_FILE).exists());
    }
}
