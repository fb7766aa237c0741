//! In-memory serializer backend.
//!
//! Physical writes still run asynchronously on the I/O scheduler, so the
//! pipeline's dispatch/barrier/commit behavior is the same as on disk. It is
//! intended for embedded usage, tests, and as a reference implementation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use crate::block::{BlockId, BlockSize};
use crate::buffer::{BlockBuffer, BufferPool};
use crate::completion::{CompletionGroup, CompletionSink};
use crate::error::KyroBlockError;
use crate::io_account::IoAccount;
use crate::storage::extent::ExtentAllocator;
use crate::storage::index::{BlockIndex, IndexSnapshot};
use crate::storage::io_pool::IoScheduler;
use crate::storage::traits::{
    lock_err, BufWriteInfo, IndexEntry, IndexWriteOp, Serializer, StorageError,
};
use crate::storage::SerializerConfig;
use crate::token::BlockToken;

type BlockMap = Arc<RwLock<HashMap<u64, Vec<u8>>>>;

/// Serializer keeping blocks and index in process memory.
pub struct InMemorySerializer {
    block_size: BlockSize,
    pool: BufferPool,
    io: IoScheduler,
    extents: Mutex<ExtentAllocator>,
    blocks: BlockMap,
    index: BlockIndex,
    write_latency: Option<Duration>,
}

impl InMemorySerializer {
    /// Creates an empty serializer.
    pub fn new(config: SerializerConfig) -> Result<Self, KyroBlockError> {
        let config = config.validate()?;
        let io = IoScheduler::start(&config.io)?;
        Ok(Self {
            block_size: config.block_size,
            pool: BufferPool::new(config.block_size, config.max_cached_buffers),
            io,
            extents: Mutex::new(ExtentAllocator::new(config.block_size.ser_value())),
            blocks: Arc::new(RwLock::new(HashMap::new())),
            index: BlockIndex::new(),
            write_latency: None,
        })
    }

    /// Delays every physical write by `latency`, emulating a slow device.
    #[must_use]
    pub fn with_write_latency(mut self, latency: Duration) -> Self {
        self.write_latency = Some(latency);
        self
    }

    /// Number of extents currently holding block data.
    pub fn stored_extents(&self) -> Result<usize, StorageError> {
        self.reclaim()?;
        Ok(self.blocks.read().map_err(|_| lock_err("memory.stored"))?.len())
    }

    /// Number of free extents below the high-water mark.
    pub fn free_extents(&self) -> Result<usize, StorageError> {
        self.reclaim()?;
        Ok(self
            .extents
            .lock()
            .map_err(|_| lock_err("memory.extents"))?
            .free_extents())
    }

    fn reclaim(&self) -> Result<(), StorageError> {
        let mut extents = self.extents.lock().map_err(|_| lock_err("memory.extents"))?;
        self.forget(extents.collect_reclaimed())
    }

    fn issue_token(&self) -> Result<BlockToken, StorageError> {
        let mut extents = self.extents.lock().map_err(|_| lock_err("memory.extents"))?;
        self.forget(extents.collect_reclaimed())?;
        Ok(extents.issue())
    }

    fn forget(&self, reclaimed: Vec<u64>) -> Result<(), StorageError> {
        if reclaimed.is_empty() {
            return Ok(());
        }
        let mut blocks = self.blocks.write().map_err(|_| lock_err("memory.reclaim"))?;
        for offset in reclaimed {
            blocks.remove(&offset);
        }
        Ok(())
    }
}

impl Serializer for InMemorySerializer {
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
            let blocks = Arc::clone(&self.blocks);
            let group = Arc::clone(&group);
            let latency = self.write_latency;

            self.io.submit(account.priority(), move || {
                if let Some(latency) = latency {
                    thread::sleep(latency);
                }
                let outcome = match blocks.write() {
                    Ok(mut map) => {
                        map.insert(held.location(), bytes);
                        Ok(())
                    }
                    Err(_) => Err(lock_err("memory.block_write")),
                };
                drop(held);
                group.finish(outcome);
            })?;
            tokens.push(token);
        }

        Ok(tokens)
    }

    fn block_read(&self, token: &BlockToken, block_id: BlockId) -> Result<BlockBuffer, StorageError> {
        let blocks = self.blocks.read().map_err(|_| lock_err("memory.block_read"))?;
        let bytes = blocks.get(&token.location()).ok_or(StorageError::ExtentNotFound {
            location: token.location(),
        })?;
        self.pool.decode(block_id, bytes)
    }

    fn index_read(&self, block_id: BlockId) -> Result<Option<IndexEntry>, StorageError> {
        self.index.get(block_id)
    }

    fn index_snapshot(&self) -> Result<IndexSnapshot, StorageError> {
        self.index.snapshot()
    }

    fn index_write(
        &self,
        ops: Vec<IndexWriteOp>,
        _account: &IoAccount,
        sink: CompletionSink,
    ) -> Result<(), StorageError> {
        // Nothing to make durable: applied inline.
        sink.complete(self.index.apply(ops));
        Ok(())
    }
}
