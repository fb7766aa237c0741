//! Block buffers and the serializer-owned buffer pool.
//!
//! A block on disk is a [`BufferHeader`] followed by the payload. In memory the
//! two halves live side by side in a [`BlockBuffer`]; callers only ever touch
//! the payload, and the header is stamped when the block is encoded for a
//! physical write.
//!
//! # On-disk block layout
//! ```text
//! [block_id: u64 LE][crc32(payload): u32 LE][payload: value() bytes]
//! ```

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crc32fast::Hasher;

use crate::block::{BlockId, BlockSize};
use crate::storage::StorageError;

/// Size of the serialized [`BufferHeader`].
pub const HEADER_SIZE: usize = 12;

/// Header preceding every block on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferHeader {
    /// Block the contents belong to.
    pub block_id: BlockId,
    /// CRC32 of the payload.
    pub checksum: u32,
}

impl BufferHeader {
    fn for_payload(block_id: BlockId, payload: &[u8]) -> Self {
        Self {
            block_id,
            checksum: checksum(payload),
        }
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.block_id.get().to_le_bytes());
        out.extend_from_slice(&self.checksum.to_le_bytes());
    }

    fn read_from(bytes: &[u8]) -> Self {
        let mut id = [0u8; 8];
        id.copy_from_slice(&bytes[0..8]);
        let mut crc = [0u8; 4];
        crc.copy_from_slice(&bytes[8..HEADER_SIZE]);
        Self {
            block_id: BlockId::new(u64::from_le_bytes(id)),
            checksum: u32::from_le_bytes(crc),
        }
    }
}

fn checksum(payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

struct PoolShared {
    block_size: BlockSize,
    live: AtomicUsize,
    free: Mutex<Vec<Box<[u8]>>>,
    max_cached: usize,
}

impl PoolShared {
    fn take_payload(&self) -> Box<[u8]> {
        let recycled = self
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        self.live.fetch_add(1, Ordering::AcqRel);
        match recycled {
            Some(mut payload) => {
                payload.fill(0);
                payload
            }
            None => vec![0u8; self.block_size.value() as usize].into_boxed_slice(),
        }
    }

    fn give_back(&self, payload: Box<[u8]>) {
        let prev = self.live.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "buffer pool released more buffers than it allocated");
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        if free.len() < self.max_cached {
            free.push(payload);
        }
    }
}

/// One block's contents, allocated from a [`BufferPool`].
///
/// Dropping the buffer releases it back to its pool, so a buffer is freed
/// exactly once by construction.
pub struct BlockBuffer {
    header: BufferHeader,
    payload: Box<[u8]>,
    pool: Arc<PoolShared>,
}

impl BlockBuffer {
    /// Payload region.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Mutable payload region.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.payload
    }

    /// Header as last read from disk. Freshly allocated buffers carry block 0
    /// and a zero checksum.
    #[must_use]
    pub const fn header(&self) -> BufferHeader {
        self.header
    }

    /// Payload length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Returns true if the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Physical-write representation: stamped header followed by the payload.
    #[must_use]
    pub fn encode_for_write(&self, block_id: BlockId) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        BufferHeader::for_payload(block_id, &self.payload).write_to(&mut out);
        out.extend_from_slice(&self.payload);
        out
    }
}

impl Drop for BlockBuffer {
    fn drop(&mut self) {
        let payload = std::mem::take(&mut self.payload);
        self.pool.give_back(payload);
    }
}

impl fmt::Debug for BlockBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockBuffer")
            .field("header", &self.header)
            .field("len", &self.payload.len())
            .finish()
    }
}

/// Serializer-owned allocator for block buffers.
///
/// Released payloads are kept in a bounded free list and handed out again
/// zeroed. Cloning the pool shares it.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    /// Creates a pool for the given block size, caching at most `max_cached`
    /// released payloads.
    #[must_use]
    pub fn new(block_size: BlockSize, max_cached: usize) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                block_size,
                live: AtomicUsize::new(0),
                free: Mutex::new(Vec::new()),
                max_cached,
            }),
        }
    }

    /// Block size this pool allocates for.
    #[must_use]
    pub fn block_size(&self) -> BlockSize {
        self.shared.block_size
    }

    /// Allocates a zeroed buffer.
    #[must_use]
    pub fn allocate(&self) -> BlockBuffer {
        BlockBuffer {
            header: BufferHeader {
                block_id: BlockId::new(0),
                checksum: 0,
            },
            payload: self.shared.take_payload(),
            pool: Arc::clone(&self.shared),
        }
    }

    /// Deep-copies `other` into a fresh allocation.
    ///
    /// # Panics
    /// Panics if `other` was sized for a different block size.
    #[must_use]
    pub fn clone_buffer(&self, other: &BlockBuffer) -> BlockBuffer {
        assert_eq!(
            other.len(),
            self.shared.block_size.value() as usize,
            "cannot clone a buffer of foreign block size"
        );
        let mut copy = self.allocate();
        copy.header = other.header;
        copy.payload.copy_from_slice(other.payload());
        copy
    }

    /// Releases a buffer. Equivalent to dropping it.
    pub fn release(&self, buf: BlockBuffer) {
        drop(buf);
    }

    /// Decodes an on-disk block read back for `expected`.
    pub fn decode(&self, expected: BlockId, bytes: &[u8]) -> Result<BlockBuffer, StorageError> {
        let ser_value = self.shared.block_size.ser_value() as usize;
        if bytes.len() != ser_value {
            return Err(StorageError::Corruption {
                message: format!(
                    "short block read for {expected}: expected {ser_value} bytes, got {}",
                    bytes.len()
                ),
            });
        }

        let header = BufferHeader::read_from(&bytes[..HEADER_SIZE]);
        let payload = &bytes[HEADER_SIZE..];
        if header.block_id != expected {
            return Err(StorageError::Corruption {
                message: format!("block header names {} but {expected} was expected", header.block_id),
            });
        }
        let computed = checksum(payload);
        if computed != header.checksum {
            return Err(StorageError::ChecksumMismatch {
                block_id: expected,
                stored: header.checksum,
                computed,
            });
        }

        let mut buf = self.allocate();
        buf.header = header;
        buf.payload.copy_from_slice(payload);
        Ok(buf)
    }

    /// Number of buffers currently allocated and not yet released.
    #[must_use]
    pub fn live(&self) -> usize {
        self.shared.live.load(Ordering::Acquire)
    }

    /// Number of released payloads held for reuse.
    #[must_use]
    pub fn cached(&self) -> usize {
        self.shared
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("block_size", &self.shared.block_size)
            .field("live", &self.live())
            .finish_non_exhaustive()
    }
}

/// Holder for at most one buffer, with checked init/free transitions.
///
/// Initializing a full slot, cloning from an empty one, or freeing an empty
/// slot are caller bugs and panic.
#[derive(Debug, Default)]
pub struct BufferSlot {
    buf: Option<BlockBuffer>,
}

impl BufferSlot {
    /// Creates an empty slot.
    #[must_use]
    pub const fn new() -> Self {
        Self { buf: None }
    }

    /// Returns true if the slot holds a buffer.
    #[must_use]
    pub const fn has(&self) -> bool {
        self.buf.is_some()
    }

    /// Fills the slot with a fresh allocation.
    pub fn init_malloc(&mut self, pool: &BufferPool) {
        assert!(self.buf.is_none(), "init_malloc on an occupied buffer slot");
        self.buf = Some(pool.allocate());
    }

    /// Fills the slot with a deep copy of `other`'s buffer.
    pub fn init_clone(&mut self, pool: &BufferPool, other: &BufferSlot) {
        assert!(self.buf.is_none(), "init_clone on an occupied buffer slot");
        let Some(src) = other.buf.as_ref() else {
            panic!("init_clone from an empty buffer slot");
        };
        self.buf = Some(pool.clone_buffer(src));
    }

    /// Frees the held buffer.
    pub fn free(&mut self) {
        assert!(self.buf.is_some(), "double free of buffer slot");
        self.buf = None;
    }

    /// Borrow the held buffer.
    #[must_use]
    pub fn get(&self) -> Option<&BlockBuffer> {
        self.buf.as_ref()
    }

    /// Mutably borrow the held buffer.
    pub fn get_mut(&mut self) -> Option<&mut BlockBuffer> {
        self.buf.as_mut()
    }

    /// Moves the buffer out, leaving the slot empty.
    pub fn take(&mut self) -> Option<BlockBuffer> {
        self.buf.take()
    }
}
