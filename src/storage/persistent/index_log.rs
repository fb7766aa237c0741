//! Append-only index log.
//!
//! Every committed batch is one frame, so a batch is recovered either whole
//! or not at all. Compaction replaces the log with a single snapshot frame.
//!
//! # File Format
//! ```text
//! [MAGIC: 4 bytes][VERSION: 1 byte]
//! [FRAME 1: codec-encoded IndexLogEntry]
//! [FRAME 2: codec-encoded IndexLogEntry]
//! ...
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{Cursor, ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::block::BlockId;
use crate::recency::Recency;
use crate::storage::traits::{IndexWriteOp, StorageError, TokenUpdate};

use super::codec;

/// Token change as persisted: tokens are stored by extent offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenRecord {
    /// Keep the current token.
    Unchanged,
    /// Block deleted.
    Cleared,
    /// Block now lives at this extent offset.
    Assigned {
        /// Byte offset in `blocks.dat`.
        location: u64,
    },
}

/// Persisted form of one [`IndexWriteOp`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexOpRecord {
    /// Target block.
    pub block_id: BlockId,
    /// Token change.
    pub token: TokenRecord,
    /// New recency.
    pub recency: Recency,
}

impl From<&IndexWriteOp> for IndexOpRecord {
    fn from(op: &IndexWriteOp) -> Self {
        let token = match &op.token {
            TokenUpdate::Unchanged => TokenRecord::Unchanged,
            TokenUpdate::Cleared => TokenRecord::Cleared,
            TokenUpdate::Assigned(token) => TokenRecord::Assigned {
                location: token.location(),
            },
        };
        Self {
            block_id: op.block_id,
            token,
            recency: op.recency,
        }
    }
}

/// One block in a snapshot frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// Block.
    pub block_id: BlockId,
    /// Extent offset, if the block has data.
    pub location: Option<u64>,
    /// Recency.
    pub recency: Recency,
}

/// A single frame of the index log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexLogEntry {
    /// Monotonically increasing sequence number.
    pub sequence: u64,
    /// When this frame was written.
    pub timestamp: DateTime<Utc>,
    /// Payload.
    pub kind: IndexLogKind,
}

/// Frame payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum IndexLogKind {
    /// One committed batch, applied in order.
    Batch(Vec<IndexOpRecord>),
    /// Full index state; replaces everything before it.
    Snapshot {
        /// On-disk block size the data file was written with.
        ser_block_size: u32,
        /// Extents ever issued when the snapshot was taken.
        high_water_extents: u64,
        /// Every index entry.
        entries: Vec<SnapshotRecord>,
    },
}

/// Append handle on `index.log`.
#[derive(Debug)]
pub struct IndexLog {
    path: PathBuf,
    file: File,
    len: u64,
    sequence: u64,
    sync_on_write: bool,
}

impl IndexLog {
    /// Opens or creates the log and returns every intact frame.
    ///
    /// A frame cut short by a crash at the tail is dropped and the file is
    /// truncated to the last complete frame. Damage anywhere else, including
    /// a damaged length that would make later frames look like a torn tail,
    /// is reported as [`StorageError::Corruption`].
    pub fn open(path: &Path, sync_on_write: bool) -> Result<(Self, Vec<IndexLogEntry>), StorageError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(StorageError::io("read index log", &e)),
        };

        if bytes.is_empty() {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)
                .map_err(|e| StorageError::io("create index log", &e))?;
            codec::write_header(&mut file).map_err(|e| StorageError::io("write log header", &e))?;
            file.sync_all().map_err(|e| StorageError::io("sync index log", &e))?;
            let log = Self::reopen(path, codec::HEADER_LEN, 0, sync_on_write)?;
            return Ok((log, Vec::new()));
        }

        let (entries, valid_len) = Self::scan(&bytes)?;
        if valid_len < bytes.len() as u64 {
            tracing::warn!(
                path = %path.display(),
                dropped_bytes = bytes.len() as u64 - valid_len,
                "truncating torn frame at end of index log"
            );
            let file = OpenOptions::new()
                .write(true)
                .open(path)
                .map_err(|e| StorageError::io("open index log", &e))?;
            file.set_len(valid_len)
                .and_then(|()| file.sync_all())
                .map_err(|e| StorageError::io("truncate index log", &e))?;
        }

        let sequence = entries.last().map_or(0, |e| e.sequence);
        let log = Self::reopen(path, valid_len, sequence, sync_on_write)?;
        Ok((log, entries))
    }

    fn scan(bytes: &[u8]) -> Result<(Vec<IndexLogEntry>, u64), StorageError> {
        let mut cursor = Cursor::new(bytes);
        codec::read_header(&mut cursor).map_err(|e| StorageError::Corruption {
            message: format!("index log header: {e}"),
        })?;

        let mut entries: Vec<IndexLogEntry> = Vec::new();
        let mut valid_len = cursor.position();
        while valid_len < bytes.len() as u64 {
            match codec::decode::<IndexLogEntry>(&mut cursor) {
                Ok(entry) => {
                    let expected = entries.last().map_or(entry.sequence, |last| last.sequence + 1);
                    if entry.sequence != expected {
                        return Err(StorageError::Corruption {
                            message: format!(
                                "index log sequence {} follows {}",
                                entry.sequence,
                                expected.saturating_sub(1)
                            ),
                        });
                    }
                    entries.push(entry);
                    valid_len = cursor.position();
                }
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => {
                    return Err(StorageError::Corruption {
                        message: format!("index log frame at byte {valid_len}: {e}"),
                    })
                }
            }
        }
        Ok((entries, valid_len))
    }

    fn reopen(path: &Path, len: u64, sequence: u64, sync_on_write: bool) -> Result<Self, StorageError> {
        let file = OpenOptions::new()
            .append(true)
            .open(path)
            .map_err(|e| StorageError::io("open index log", &e))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            len,
            sequence,
            sync_on_write,
        })
    }

    /// Appends one frame and returns its sequence number.
    ///
    /// On failure the file is cut back to its previous length so no partial
    /// frame is left in the middle of the log.
    pub fn append(&mut self, kind: IndexLogKind) -> Result<u64, StorageError> {
        let sequence = self.sequence + 1;
        let frame = codec::encode(&IndexLogEntry {
            sequence,
            timestamp: Utc::now(),
            kind,
        })
        .map_err(|e| StorageError::SerializationError(e.to_string()))?;

        let written = self.file.write_all(&frame).and_then(|()| {
            if self.sync_on_write {
                self.file.sync_data()
            } else {
                Ok(())
            }
        });
        if let Err(e) = written {
            if let Err(undo) = self.file.set_len(self.len) {
                tracing::error!(error = %undo, "failed to cut back index log after a failed append");
            }
            return Err(StorageError::io("append index log", &e));
        }

        self.len += frame.len() as u64;
        self.sequence = sequence;
        Ok(sequence)
    }

    /// Atomically replaces the log with a header and one frame.
    ///
    /// The frame is written to a temporary file, synced, then renamed over
    /// the log. A crash at any point leaves either the old or the new log.
    pub fn rewrite(&mut self, kind: IndexLogKind) -> Result<(), StorageError> {
        let sequence = self.sequence + 1;
        let frame = codec::encode(&IndexLogEntry {
            sequence,
            timestamp: Utc::now(),
            kind,
        })
        .map_err(|e| StorageError::SerializationError(e.to_string()))?;

        let temp_path = self.path.with_extension(format!("log.tmp.{}", Uuid::new_v4()));
        let result = Self::write_temp(&temp_path, &frame).and_then(|()| {
            fs::rename(&temp_path, &self.path).map_err(|e| StorageError::io("rename index log", &e))
        });
        if let Err(err) = result {
            let _ = fs::remove_file(&temp_path);
            return Err(err);
        }

        // The old handle now points at the replaced inode.
        let len = codec::HEADER_LEN + frame.len() as u64;
        *self = Self::reopen(&self.path, len, sequence, self.sync_on_write)?;
        Self::sync_parent(&self.path)
    }

    fn write_temp(path: &Path, frame: &[u8]) -> Result<(), StorageError> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| StorageError::io("create compacted log", &e))?;
        codec::write_header(&mut file)
            .and_then(|()| file.write_all(frame))
            .and_then(|()| file.sync_all())
            .map_err(|e| StorageError::io("write compacted log", &e))
    }

    #[cfg(unix)]
    fn sync_parent(path: &Path) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            File::open(parent)
                .and_then(|dir| dir.sync_all())
                .map_err(|e| StorageError::io("sync database directory", &e))?;
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_parent(_path: &Path) -> Result<(), StorageError> {
        Ok(())
    }

    /// Sequence number of the last frame.
    #[must_use]
    pub const fn current_sequence(&self) -> u64 {
        self.sequence
    }

    /// Log size in bytes, header included.
    #[must_use]
    pub const fn size_bytes(&self) -> u64 {
        self.len
    }

    /// Path of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn batch(block: u64, location: u64) -> IndexLogKind {
        IndexLogKind::Batch(vec![IndexOpRecord {
            block_id: BlockId::new(block),
            token: TokenRecord::Assigned { location },
            recency: Recency::new(1),
        }])
    }

    #[test]
    fn test_append_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.log");

        {
            let (mut log, entries) = IndexLog::open(&path, false).unwrap();
            assert!(entries.is_empty());
            assert_eq!(log.append(batch(1, 0)).unwrap(), 1);
            assert_eq!(log.append(batch(2, 76)).unwrap(), 2);
        }

        let (log, entries) = IndexLog::open(&path, false).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(log.current_sequence(), 2);
        assert!(matches!(&entries[1].kind, IndexLogKind::Batch(ops) if ops[0].block_id == BlockId::new(2)));
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.log");
        let intact_len = {
            let (mut log, _) = IndexLog::open(&path, false).unwrap();
            log.append(batch(1, 0)).unwrap();
            let intact = log.size_bytes();
            log.append(batch(2, 76)).unwrap();
            intact
        };

        let full = fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(full - 3).unwrap();
        drop(file);

        let (log, entries) = IndexLog::open(&path, false).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(log.size_bytes(), intact_len);
        assert_eq!(fs::metadata(&path).unwrap().len(), intact_len);
    }

    #[test]
    fn test_damaged_length_does_not_truncate_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.log");
        {
            let (mut log, _) = IndexLog::open(&path, false).unwrap();
            for i in 0..5 {
                log.append(batch(i, i * 76)).unwrap();
            }
        }

        let mut bytes = fs::read(&path).unwrap();
        let len = bytes.len() as u64;
        // Third byte of the first frame's length: points far past EOF.
        bytes[codec::HEADER_LEN as usize + 1 + 2] = 0x10;
        fs::write(&path, bytes).unwrap();

        let err = IndexLog::open(&path, false).unwrap_err();
        assert!(matches!(err, StorageError::Corruption { .. }), "got {err:?}");
        assert_eq!(fs::metadata(&path).unwrap().len(), len);
    }

    #[test]
    fn test_checksum_failure_is_corruption() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.log");
        {
            let (mut log, _) = IndexLog::open(&path, false).unwrap();
            log.append(batch(1, 0)).unwrap();
            log.append(batch(2, 76)).unwrap();
        }

        let mut bytes = fs::read(&path).unwrap();
        // First frame payload starts after the header and the frame prefix.
        bytes[codec::HEADER_LEN as usize + codec::FRAME_PREFIX_LEN + 3] ^= 0xFF;
        fs::write(&path, bytes).unwrap();

        let err = IndexLog::open(&path, false).unwrap_err();
        assert!(matches!(err, StorageError::Corruption { .. }), "got {err:?}");
    }

    #[test]
    fn test_rewrite_replaces_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.log");
        let (mut log, _) = IndexLog::open(&path, false).unwrap();
        for i in 0..10 {
            log.append(batch(i, i * 76)).unwrap();
        }
        let before = log.size_bytes();

        log.rewrite(IndexLogKind::Snapshot {
            ser_block_size: 76,
            high_water_extents: 10,
            entries: Vec::new(),
        })
        .unwrap();
        assert!(log.size_bytes() < before);
        log.append(batch(42, 0)).unwrap();
        drop(log);

        let (log, entries) = IndexLog::open(&path, false).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(matches!(entries[0].kind, IndexLogKind::Snapshot { .. }));
        assert_eq!(log.current_sequence(), 12);

        let leftovers = fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().contains(".tmp."))
            .count();
        assert_eq!(leftovers, 0);
    }
}
