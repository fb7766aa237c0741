//! File-backed serializer.
//!
//! Commit ordering: a batch's frame is appended (and synced) to the index
//! log before the in-memory index is updated, both under the log mutex, so
//! the log order and the index order always agree. Commits run on the I/O
//! workers, next to the block writes, and signal the committer's sink.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::block::{BlockId, BlockSize};
use crate::buffer::{BlockBuffer, BufferPool};
use crate::completion::{CompletionGroup, CompletionSink};
use crate::error::{ConfigError, KyroBlockError};
use crate::io_account::IoAccount;
use crate::recency::Recency;
use crate::storage::extent::ExtentAllocator;
use crate::storage::index::{BlockIndex, IndexSnapshot};
use crate::storage::io_pool::IoScheduler;
use crate::storage::traits::{
    lock_err, BufWriteInfo, IndexEntry, IndexWriteOp, Serializer, StorageError,
};
use crate::token::BlockToken;

use super::data_file::{DataFile, DATA_FILE};
use super::file_lock::FileLock;
use super::index_log::{IndexLog, IndexLogEntry, IndexLogKind, IndexOpRecord, SnapshotRecord, TokenRecord};
use super::PersistentConfig;

/// Name of the index log inside the database directory.
pub const INDEX_LOG_FILE: &str = "index.log";

/// Result of an index log compaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionResult {
    /// Entries written to the snapshot frame.
    pub entries: usize,
    /// Log size before compaction.
    pub log_size_before: u64,
    /// Log size after compaction.
    pub log_size_after: u64,
}

type RecoveredIndex = HashMap<BlockId, (Option<u64>, Recency)>;

/// Index log plus the in-memory index it describes.
struct IndexJournal {
    log: Mutex<IndexLog>,
    index: BlockIndex,
    extents: Arc<Mutex<ExtentAllocator>>,
    ser_block_size: u32,
    max_log_size: u64,
}

impl IndexJournal {
    fn commit(&self, ops: Vec<IndexWriteOp>) -> Result<(), StorageError> {
        let records: Vec<IndexOpRecord> = ops.iter().map(IndexOpRecord::from).collect();

        let mut log = self.log.lock().map_err(|_| lock_err("persistent.log"))?;
        log.append(IndexLogKind::Batch(records))?;
        self.index.apply(ops)?;

        if log.size_bytes() > self.max_log_size {
            // The batch is already durable; a failed compaction only leaves a long log.
            if let Err(err) = self.compact_locked(&mut log) {
                tracing::warn!(error = %err, "index log compaction failed");
            }
        }
        Ok(())
    }

    fn compact(&self) -> Result<CompactionResult, StorageError> {
        let mut log = self.log.lock().map_err(|_| lock_err("persistent.log"))?;
        self.compact_locked(&mut log)
    }

    fn compact_locked(&self, log: &mut IndexLog) -> Result<CompactionResult, StorageError> {
        let log_size_before = log.size_bytes();
        let snapshot = self.index.snapshot()?;
        let entries: Vec<SnapshotRecord> = snapshot
            .iter()
            .map(|(block_id, entry)| SnapshotRecord {
                block_id: *block_id,
                location: entry.token.as_ref().map(BlockToken::location),
                recency: entry.recency,
            })
            .collect();
        let count = entries.len();

        let high_water = {
            let extents = self.extents.lock().map_err(|_| lock_err("persistent.extents"))?;
            extents.high_water() / extents.extent_size()
        };

        log.rewrite(IndexLogKind::Snapshot {
            ser_block_size: self.ser_block_size,
            high_water_extents: high_water,
            entries,
        })?;

        let result = CompactionResult {
            entries: count,
            log_size_before,
            log_size_after: log.size_bytes(),
        };
        tracing::info!(
            entries = result.entries,
            before = result.log_size_before,
            after = result.log_size_after,
            "compacted index log"
        );
        Ok(result)
    }
}

/// Durable serializer over `blocks.dat` and `index.log` in one directory.
pub struct PersistentSerializer {
    dir: PathBuf,
    config: PersistentConfig,
    block_size: BlockSize,
    pool: BufferPool,
    // Declared before `_lock` so queued writes and commits drain while it is held.
    io: IoScheduler,
    extents: Arc<Mutex<ExtentAllocator>>,
    data: Arc<DataFile>,
    journal: Arc<IndexJournal>,
    _lock: FileLock,
}

impl PersistentSerializer {
    /// Opens or creates a database directory and recovers its index.
    ///
    /// # Errors
    /// - [`StorageError::Locked`] if another process has the directory open
    /// - [`StorageError::Corruption`] if the index log is damaged before its tail
    /// - [`ConfigError::BlockSizeMismatch`] if the directory was created with
    ///   another block size
    pub fn open(dir: &Path, config: PersistentConfig) -> Result<Self, KyroBlockError> {
        let config = config.validate()?;
        let block_size = config.serializer.block_size;

        fs::create_dir_all(dir).map_err(|e| StorageError::io("create database directory", &e))?;
        let lock = FileLock::acquire(dir)?;
        let data = DataFile::open(&dir.join(DATA_FILE))?;
        let (mut log, frames) = IndexLog::open(&dir.join(INDEX_LOG_FILE), config.sync_on_write)?;

        let extent_size = u64::from(block_size.ser_value());
        let fresh = frames.is_empty();
        let (recovered, logged_high_water) = Self::replay(frames, block_size)?;

        let mut high_water = data.len()?.div_ceil(extent_size).max(logged_high_water);
        let mut in_use = HashSet::with_capacity(recovered.len());
        for (block_id, (location, _)) in &recovered {
            let Some(location) = *location else { continue };
            if location % extent_size != 0 || !in_use.insert(location) {
                return Err(StorageError::Corruption {
                    message: format!("{block_id} maps to invalid or shared extent {location}"),
                }
                .into());
            }
            high_water = high_water.max(location / extent_size + 1);
        }

        let mut extents = ExtentAllocator::recover(block_size.ser_value(), high_water, &in_use);
        let entries: HashMap<BlockId, IndexEntry> = recovered
            .into_iter()
            .map(|(block_id, (location, recency))| {
                let token = location.map(|l| extents.adopt(l));
                (block_id, IndexEntry { token, recency })
            })
            .collect();

        if fresh {
            log.append(IndexLogKind::Snapshot {
                ser_block_size: block_size.ser_value(),
                high_water_extents: high_water,
                entries: Vec::new(),
            })?;
        }

        tracing::info!(
            dir = %dir.display(),
            blocks = entries.len(),
            live_extents = in_use.len(),
            free_extents = extents.free_extents(),
            log_bytes = log.size_bytes(),
            "opened persistent serializer"
        );

        let io = IoScheduler::start(&config.serializer.io)?;
        let extents = Arc::new(Mutex::new(extents));
        let journal = Arc::new(IndexJournal {
            log: Mutex::new(log),
            index: BlockIndex::from_entries(entries),
            extents: Arc::clone(&extents),
            ser_block_size: block_size.ser_value(),
            max_log_size: config.max_index_log_size,
        });
        Ok(Self {
            dir: dir.to_path_buf(),
            _lock: lock,
            block_size,
            pool: BufferPool::new(block_size, config.serializer.max_cached_buffers),
            io,
            extents,
            data: Arc::new(data),
            journal,
            config,
        })
    }

    fn replay(
        frames: Vec<IndexLogEntry>,
        block_size: BlockSize,
    ) -> Result<(RecoveredIndex, u64), KyroBlockError> {
        let mut index: RecoveredIndex = HashMap::new();
        let mut high_water = 0;
        let mut batches = 0usize;

        for frame in frames {
            match frame.kind {
                IndexLogKind::Snapshot {
                    ser_block_size,
                    high_water_extents,
                    entries,
                } => {
                    if ser_block_size != block_size.ser_value() {
                        return Err(ConfigError::BlockSizeMismatch {
                            configured: block_size.ser_value(),
                            stored: ser_block_size,
                        }
                        .into());
                    }
                    high_water = high_water_extents;
                    index = entries
                        .into_iter()
                        .map(|r| (r.block_id, (r.location, r.recency)))
                        .collect();
                }
                IndexLogKind::Batch(ops) => {
                    batches += 1;
                    for op in ops {
                        let entry = index.entry(op.block_id).or_insert((None, Recency::INVALID));
                        match op.token {
                            TokenRecord::Unchanged => {}
                            TokenRecord::Cleared => entry.0 = None,
                            TokenRecord::Assigned { location } => entry.0 = Some(location),
                        }
                        entry.1 = op.recency;
                    }
                }
            }
        }

        tracing::debug!(batches, blocks = index.len(), "replayed index log");
        Ok((index, high_water))
    }

    /// Rewrites the index log as a single snapshot frame.
    ///
    /// Runs on the calling thread.
    pub fn compact_index(&self) -> Result<CompactionResult, StorageError> {
        self.journal.compact()
    }

    /// Current index log size in bytes.
    pub fn index_log_size(&self) -> Result<u64, StorageError> {
        Ok(self
            .journal
            .log
            .lock()
            .map_err(|_| lock_err("persistent.log"))?
            .size_bytes())
    }

    /// Number of free extents below the high-water mark.
    pub fn free_extents(&self) -> Result<usize, StorageError> {
        let mut extents = self.extents.lock().map_err(|_| lock_err("persistent.extents"))?;
        extents.collect_reclaimed();
        Ok(extents.free_extents())
    }

    /// Database directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn issue_token(&self) -> Result<BlockToken, StorageError> {
        Ok(self
            .extents
            .lock()
            .map_err(|_| lock_err("persistent.extents"))?
            .issue())
    }
}

impl Serializer for PersistentSerializer {
    fn block_size(&self) -> BlockSize {
        self.block_size
    }

    fn buffer_pool(&self) -> &BufferPool {
        &self.pool
    }

    fn io_scheduler(&self) -> &IoScheduler {
        &self.io
    }

    fn block_writes(
        &self,
        writes: Vec<BufWriteInfo>,
        account: &IoAccount,
        sink: CompletionSink,
    ) -> Result<Vec<BlockToken>, StorageError> {
        let group = CompletionGroup::new(sink, writes.len());
        let mut tokens = Vec::with_capacity(writes.len());

        for info in writes {
            assert_eq!(info.block_size, self.block_size, "block size mismatch for {}", info.block_id);
            assert_eq!(
                info.buf.len(),
                self.block_size.value() as usize,
                "buffer for {} is not one block",
                info.block_id
            );

            let token = self.issue_token()?;
            let bytes = info.buf.encode_for_write(info.block_id);
            let held = token.clone();
            let data = Arc::clone(&self.data);
            let group = Arc::clone(&group);
            let sync = self.config.sync_on_write;

            self.io.submit(account.priority(), move || {
                let outcome = data.write_at(held.location(), &bytes, sync);
                if let Err(err) = &outcome {
                    tracing::error!(location = held.location(), error = %err, "block write failed");
                }
                drop(held);
                group.finish(outcome);
            })?;
            tokens.push(token);
        }

        Ok(tokens)
    }

    fn block_read(&self, token: &BlockToken, block_id: BlockId) -> Result<BlockBuffer, StorageError> {
        let bytes = self.data.read_at(token.location(), token.size() as usize)?;
        self.pool.decode(block_id, &bytes)
    }

    fn index_read(&self, block_id: BlockId) -> Result<Option<IndexEntry>, StorageError> {
        self.journal.index.get(block_id)
    }

    fn index_snapshot(&self) -> Result<IndexSnapshot, StorageError> {
        self.journal.index.snapshot()
    }

    fn index_write(
        &self,
        ops: Vec<IndexWriteOp>,
        account: &IoAccount,
        sink: CompletionSink,
    ) -> Result<(), StorageError> {
        let journal = Arc::clone(&self.journal);
        self.io.submit(account.priority(), move || {
            let outcome = journal.commit(ops);
            if let Err(err) = &outcome {
                tracing::error!(error = %err, "index commit failed");
            }
            sink.complete(outcome);
        })?;
        Ok(())
    }
}
