//! Write-ahead log.
//!
//! One `wal.log` per data directory, a plain stream of framed entries:
//!
//! ```text
//! Entry: [Length:4 | Seq:8 | CRC32:4 | Payload:N]
//! ```
//!
//! `Length` counts everything after the length field. The payload is the
//! bincode-serialized [`LogEntry`] and the checksum covers the payload
//! bytes. Writes are strictly append and fsynced before success is
//! reported; a truncated or checksum-failing tail is treated as torn by a
//! crash and discarded.

use crate::error::{Result, StoreError};
use crate::types::{LogEntry, SEQ_UNASSIGNED};
use crc32fast::Hasher;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Current WAL file name inside a data directory.
pub const WAL_FILE: &str = "wal.log";

/// Transient file used when rotating the log.
const WAL_TMP_FILE: &str = "wal.tmp";

/// Upper bound on a single frame; anything larger is treated as garbage
/// from a torn write.
const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

fn crc32(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Encode one entry into its on-disk frame.
fn encode_frame(entry: &LogEntry) -> Result<Vec<u8>> {
    let payload = bincode::serialize(entry)?;
    let length = 8 + 4 + payload.len();

    let mut frame = Vec::with_capacity(4 + length);
    frame.extend_from_slice(&(length as u32).to_be_bytes());
    frame.extend_from_slice(&entry.seq.to_be_bytes());
    frame.extend_from_slice(&crc32(&payload).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Outcome of reading one frame from the log.
enum Frame {
    Entry(LogEntry),
    /// Clean end of file.
    Eof,
    /// Short or checksum-failing tail; everything from `valid_len` on is
    /// discarded.
    Torn { reason: String },
}

/// Read a single frame. `offset` is only used for diagnostics.
fn read_frame<R: Read>(reader: &mut R, offset: u64) -> Result<Frame> {
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = reader.read(&mut len_buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(Frame::Eof);
            }
            return Ok(Frame::Torn {
                reason: format!("partial length prefix ({} bytes)", filled),
            });
        }
        filled += n;
    }

    let length = u32::from_be_bytes(len_buf);
    if length < 12 || length > MAX_FRAME_LEN {
        return Ok(Frame::Torn {
            reason: format!("implausible frame length {}", length),
        });
    }

    let mut body = vec![0u8; length as usize];
    let mut filled = 0;
    while filled < body.len() {
        let n = reader.read(&mut body[filled..])?;
        if n == 0 {
            return Ok(Frame::Torn {
                reason: format!("truncated frame: {} of {} bytes", filled, length),
            });
        }
        filled += n;
    }

    let seq = u64::from_be_bytes(body[0..8].try_into().unwrap_or([0u8; 8]));
    let expected = u32::from_be_bytes(body[8..12].try_into().unwrap_or([0u8; 4]));
    let payload = &body[12..];
    let actual = crc32(payload);
    if expected != actual {
        return Ok(Frame::Torn {
            reason: format!(
                "checksum mismatch at offset {}: expected {:08x}, got {:08x}",
                offset, expected, actual
            ),
        });
    }

    let entry: LogEntry = bincode::deserialize(payload).map_err(|e| StoreError::CorruptedWal {
        offset,
        reason: format!("payload decode failed: {}", e),
    })?;
    if entry.seq != seq {
        return Err(StoreError::CorruptedWal {
            offset,
            reason: format!("frame seq {} disagrees with payload seq {}", seq, entry.seq),
        });
    }
    Ok(Frame::Entry(entry))
}

/// Scan the log, feeding every well-formed entry to `visit`.
///
/// Returns `(last_seq, valid_len)` where `valid_len` is the byte length of
/// the well-formed prefix. Scanning stops at the first torn frame.
fn scan<F: FnMut(LogEntry)>(path: &Path, mut visit: F) -> Result<(u64, u64)> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((0, 0)),
        Err(e) => return Err(e.into()),
    };
    let mut reader = BufReader::new(file);
    let mut last_seq = 0u64;
    let mut valid_len = 0u64;

    loop {
        match read_frame(&mut reader, valid_len)? {
            Frame::Eof => break,
            Frame::Torn { reason } => {
                warn!("wal tail torn at offset {}: {}", valid_len, reason);
                break;
            }
            Frame::Entry(entry) => {
                let payload_len = bincode::serialized_size(&entry)?;
                valid_len += 4 + 8 + 4 + payload_len;
                last_seq = entry.seq;
                visit(entry);
            }
        }
    }

    Ok((last_seq, valid_len))
}

/// Replay every entry with sequence strictly greater than `after_seq`, in
/// log order. Stops silently at a torn tail.
pub fn replay(dir: &Path, after_seq: u64) -> Result<Vec<LogEntry>> {
    let mut entries = Vec::new();
    scan(&dir.join(WAL_FILE), |entry| {
        if entry.seq > after_seq {
            entries.push(entry);
        }
    })?;
    Ok(entries)
}

/// Appending handle over `wal.log`. There is exactly one writer per data
/// directory; it owns sequence assignment.
pub struct WalWriter {
    file: File,
    dir: PathBuf,
    last_seq: u64,
}

impl WalWriter {
    /// Open (or create) the log for appending.
    ///
    /// A torn tail left by a crash is cut off in place before any append.
    /// `floor_seq` is the highest sequence already covered by a durable
    /// snapshot; numbering continues from whichever of the two is greater
    /// so sequences stay dense across truncation.
    pub fn open(dir: &Path, floor_seq: u64) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(WAL_FILE);

        let (last_valid_seq, valid_len) = scan(&path, |_| {})?;
        if path.exists() {
            let actual_len = fs::metadata(&path)?.len();
            if actual_len > valid_len {
                warn!(
                    "discarding {} torn bytes at the end of {}",
                    actual_len - valid_len,
                    path.display()
                );
                let file = OpenOptions::new().write(true).open(&path)?;
                file.set_len(valid_len)?;
                file.sync_all()?;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            file,
            dir: dir.to_path_buf(),
            last_seq: last_valid_seq.max(floor_seq),
        })
    }

    /// Highest sequence durable in this log.
    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    /// Append one entry and fsync.
    ///
    /// An unassigned entry receives the next sequence; an entry replicated
    /// with a pre-assigned sequence must continue the log exactly, anything
    /// else is a [`StoreError::SequenceGap`]. On any error the entry must be
    /// treated as not durable.
    pub fn append(&mut self, entry: &mut LogEntry) -> Result<u64> {
        if entry.seq == SEQ_UNASSIGNED {
            entry.seq = self.last_seq + 1;
        } else if entry.seq != self.last_seq + 1 {
            return Err(StoreError::SequenceGap {
                expected: self.last_seq + 1,
                got: entry.seq,
            });
        }

        let frame = encode_frame(entry)?;
        self.file.write_all(&frame)?;
        self.file.sync_all()?;
        self.last_seq = entry.seq;
        Ok(entry.seq)
    }

    /// Drop every entry at or below `seq` by rotating to a fresh file.
    ///
    /// Only permitted when a snapshot at or after `seq` is durable; the
    /// retained tail is rewritten through a temp file and renamed over the
    /// log so a crash mid-rotation leaves one of the two complete states.
    pub fn truncate_through(&mut self, seq: u64, snapshot_seq: u64) -> Result<()> {
        if snapshot_seq < seq {
            return Err(StoreError::TruncateDenied { seq, snapshot_seq });
        }

        let retained = replay(&self.dir, seq)?;
        let tmp_path = self.dir.join(WAL_TMP_FILE);
        let path = self.dir.join(WAL_FILE);

        let mut tmp = File::create(&tmp_path)?;
        for entry in &retained {
            tmp.write_all(&encode_frame(entry)?)?;
        }
        tmp.sync_all()?;
        drop(tmp);

        fs::rename(&tmp_path, &path)?;
        File::open(&self.dir)?.sync_all()?;

        self.file = OpenOptions::new().append(true).open(&path)?;
        Ok(())
    }
}
