//! Abstract serializer contract.
//!
//! The write pipeline only ever talks to storage through [`Serializer`]:
//! - buffer allocation (`malloc`/`clone_buffer`/`release_buffer`)
//! - physical block writes that issue one [`BlockToken`] per block
//! - an atomic `index_write` of a whole batch of [`IndexWriteOp`]s
//! - the [`IoScheduler`] whose queue slots callers reserve before submitting
//!
//! By using a trait, we enable:
//! - An in-memory backend for tests and embedded use
//! - A file-backed backend for durable storage

use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::block::{BlockId, BlockSize};
use crate::buffer::{BlockBuffer, BufferPool};
use crate::completion::CompletionSink;
use crate::io_account::{IoAccount, IoPriority};
use crate::recency::Recency;
use crate::storage::index::IndexSnapshot;
use crate::storage::io_pool::IoScheduler;
use crate::token::BlockToken;

/// Errors that can occur during storage operations.
///
/// `Clone` so that one failed write can be reported to every waiter.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    /// No block data stored at the token's location.
    #[error("No block stored at offset {location}")]
    ExtentNotFound {
        /// Offset that was looked up.
        location: u64,
    },

    /// Block payload does not match its header checksum.
    #[error("Checksum mismatch for {block_id}: stored={stored:08x}, computed={computed:08x}")]
    ChecksumMismatch {
        /// Block being read.
        block_id: BlockId,
        /// Checksum in the header.
        stored: u32,
        /// Checksum of the payload read.
        computed: u32,
    },

    /// On-disk structures are inconsistent.
    #[error("Corruption detected: {message}")]
    Corruption {
        /// Description.
        message: String,
    },

    /// An I/O call failed.
    #[error("I/O error during {context}: {message}")]
    Io {
        /// What was being done.
        context: String,
        /// Kind of the underlying error.
        kind: io::ErrorKind,
        /// Rendered underlying error.
        message: String,
    },

    /// Another process holds the database lock.
    #[error("Database is locked: {message}")]
    Locked {
        /// Description.
        message: String,
    },

    /// The I/O worker pool has shut down.
    #[error("I/O pool '{path}' is disconnected")]
    Disconnected {
        /// Pool that refused the job.
        path: String,
    },

    /// A job was submitted to a pool whose queue had no room.
    #[error("I/O pool '{path}' queue is full")]
    QueueFull {
        /// Pool that refused the job.
        path: String,
    },

    /// A physical write was dropped before it was signaled.
    #[error("Physical write abandoned before completion")]
    WriteAbandoned,

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl StorageError {
    /// Wraps an I/O error with the operation that produced it.
    #[must_use]
    pub fn io(context: impl Into<String>, err: &io::Error) -> Self {
        Self::Io {
            context: context.into(),
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

pub(crate) fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

/// One block handed to [`Serializer::block_writes`].
#[derive(Debug, Clone)]
pub struct BufWriteInfo {
    /// Contents to write.
    pub buf: Arc<BlockBuffer>,
    /// Block size the caller sized the buffer for.
    pub block_size: BlockSize,
    /// Block the contents belong to; stamped into the on-disk header.
    pub block_id: BlockId,
}

impl BufWriteInfo {
    /// Creates a write info.
    #[must_use]
    pub const fn new(buf: Arc<BlockBuffer>, block_size: BlockSize, block_id: BlockId) -> Self {
        Self {
            buf,
            block_size,
            block_id,
        }
    }
}

/// How an index update changes the block's token.
#[derive(Debug, Clone)]
pub enum TokenUpdate {
    /// Keep whatever token the index holds.
    Unchanged,
    /// Drop the token (block deleted).
    Cleared,
    /// Point the block at a freshly written token.
    Assigned(BlockToken),
}

/// The durable outcome of one write descriptor.
#[derive(Debug, Clone)]
pub struct IndexWriteOp {
    /// Target block.
    pub block_id: BlockId,
    /// Token change.
    pub token: TokenUpdate,
    /// New recency.
    pub recency: Recency,
}

impl IndexWriteOp {
    /// Points `block_id` at `token` with `recency`.
    #[must_use]
    pub const fn assign(block_id: BlockId, token: BlockToken, recency: Recency) -> Self {
        Self {
            block_id,
            token: TokenUpdate::Assigned(token),
            recency,
        }
    }

    /// Clears `block_id`: null token, invalid recency.
    #[must_use]
    pub const fn clear(block_id: BlockId) -> Self {
        Self {
            block_id,
            token: TokenUpdate::Cleared,
            recency: Recency::INVALID,
        }
    }

    /// Sets only the recency of `block_id`.
    #[must_use]
    pub const fn touch(block_id: BlockId, recency: Recency) -> Self {
        Self {
            block_id,
            token: TokenUpdate::Unchanged,
            recency,
        }
    }
}

/// What the index records for one block.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    /// Current token; `None` if never written or deleted.
    pub token: Option<BlockToken>,
    /// Current recency.
    pub recency: Recency,
}

impl IndexEntry {
    /// Entry with no token and invalid recency.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            token: None,
            recency: Recency::INVALID,
        }
    }
}

/// Storage contract required by the write pipeline.
///
/// # Contract
/// - `block_writes` returns exactly one token per submitted block, issued
///   before the physical write completes, and signals `sink` exactly once,
///   asynchronously, when all submitted blocks are durable.
/// - `index_write` applies a whole batch atomically: concurrent readers see
///   either none or all of it, and after a crash either none or all of it is
///   recovered. It signals its own sink once the batch is durable and
///   visible, so blocking work such as a log fsync stays off the caller.
/// - Neither call blocks the calling thread. Jobs go to `io_scheduler()`,
///   and the caller holds a reserved [`QueueSlot`](crate::storage::QueueSlot)
///   in the sink for each one.
/// - A token's extent is never reused while any clone of the token is alive.
pub trait Serializer: Send + Sync {
    /// Configured block size.
    fn block_size(&self) -> BlockSize;

    /// Allocator for buffers of this serializer's block size.
    fn buffer_pool(&self) -> &BufferPool;

    /// Worker pools running this serializer's physical I/O.
    fn io_scheduler(&self) -> &IoScheduler;

    /// Submits physical writes; see the trait contract.
    ///
    /// # Panics
    /// Implementations panic if a buffer does not match the configured block size.
    fn block_writes(
        &self,
        writes: Vec<BufWriteInfo>,
        account: &IoAccount,
        sink: CompletionSink,
    ) -> Result<Vec<BlockToken>, StorageError>;

    /// Reads back the block a token refers to.
    fn block_read(&self, token: &BlockToken, block_id: BlockId) -> Result<BlockBuffer, StorageError>;

    /// Current index entry for a block.
    fn index_read(&self, block_id: BlockId) -> Result<Option<IndexEntry>, StorageError>;

    /// Point-in-time copy of the index. Holds its tokens alive.
    fn index_snapshot(&self) -> Result<IndexSnapshot, StorageError>;

    /// Applies a batch of index updates atomically, in order, and signals
    /// `sink` with the outcome.
    ///
    /// An `Err` return means the commit was never started.
    fn index_write(
        &self,
        ops: Vec<IndexWriteOp>,
        account: &IoAccount,
        sink: CompletionSink,
    ) -> Result<(), StorageError>;

    /// Allocates a zeroed buffer.
    fn malloc(&self) -> BlockBuffer {
        self.buffer_pool().allocate()
    }

    /// Deep-copies a buffer.
    fn clone_buffer(&self, buf: &BlockBuffer) -> BlockBuffer {
        self.buffer_pool().clone_buffer(buf)
    }

    /// Releases a buffer.
    fn release_buffer(&self, buf: BlockBuffer) {
        self.buffer_pool().release(buf);
    }

    /// Account without an outstanding-request limit.
    fn make_io_account(&self, priority: IoPriority) -> IoAccount {
        IoAccount::unlimited(priority)
    }

    /// Account admitting at most `outstanding` writes at once.
    fn make_io_account_with_limit(&self, priority: IoPriority, outstanding: usize) -> IoAccount {
        IoAccount::new(priority, outstanding)
    }
}
