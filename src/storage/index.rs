//! In-memory block index shared by the serializer backends.
//!
//! A batch is applied under one write lock, so readers observe either none or
//! all of it. Ops are applied in order; two updates to the same block in one
//! batch resolve to the later one.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use crate::block::BlockId;
use crate::storage::traits::{lock_err, IndexEntry, IndexWriteOp, StorageError, TokenUpdate};
use crate::token::BlockToken;

/// Block id → current token and recency.
#[derive(Debug, Default)]
pub struct BlockIndex {
    entries: RwLock<HashMap<BlockId, IndexEntry>>,
}

impl BlockIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an index from recovered entries.
    #[must_use]
    pub fn from_entries(entries: HashMap<BlockId, IndexEntry>) -> Self {
        Self {
            entries: RwLock::new(entries),
        }
    }

    /// Applies `ops` atomically and in order.
    ///
    /// Tokens displaced by the batch are dropped after the lock is released.
    pub fn apply(&self, ops: Vec<IndexWriteOp>) -> Result<(), StorageError> {
        let mut displaced: Vec<BlockToken> = Vec::new();
        {
            let mut entries = self.entries.write().map_err(|_| lock_err("index.apply"))?;
            for op in ops {
                let entry = entries.entry(op.block_id).or_insert_with(IndexEntry::empty);
                match op.token {
                    TokenUpdate::Unchanged => {}
                    TokenUpdate::Cleared => displaced.extend(entry.token.take()),
                    TokenUpdate::Assigned(token) => displaced.extend(entry.token.replace(token)),
                }
                entry.recency = op.recency;
            }
        }
        drop(displaced);
        Ok(())
    }

    /// Current entry for a block.
    pub fn get(&self, block_id: BlockId) -> Result<Option<IndexEntry>, StorageError> {
        let entries = self.entries.read().map_err(|_| lock_err("index.get"))?;
        Ok(entries.get(&block_id).cloned())
    }

    /// Point-in-time copy of every entry.
    pub fn snapshot(&self) -> Result<IndexSnapshot, StorageError> {
        let entries = self.entries.read().map_err(|_| lock_err("index.snapshot"))?;
        Ok(IndexSnapshot {
            entries: entries.clone(),
        })
    }

    /// Locations referenced by live entries.
    pub fn referenced_locations(&self) -> Result<HashSet<u64>, StorageError> {
        let entries = self.entries.read().map_err(|_| lock_err("index.referenced"))?;
        Ok(entries
            .values()
            .filter_map(|e| e.token.as_ref().map(BlockToken::location))
            .collect())
    }

    /// Number of blocks with an entry, deleted ones included.
    pub fn len(&self) -> Result<usize, StorageError> {
        Ok(self.entries.read().map_err(|_| lock_err("index.len"))?.len())
    }

    /// Returns true if the index has no entries.
    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }
}

/// Immutable copy of the index taken at one instant.
///
/// Holding a snapshot keeps every token it references alive, so their extents
/// cannot be reclaimed while it exists.
#[derive(Debug, Clone, Default)]
pub struct IndexSnapshot {
    entries: HashMap<BlockId, IndexEntry>,
}

impl IndexSnapshot {
    /// Entry for a block at snapshot time.
    #[must_use]
    pub fn get(&self, block_id: BlockId) -> Option<&IndexEntry> {
        self.entries.get(&block_id)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the snapshot is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over all entries.
    pub fn iter(&self) -> impl Iterator<Item = (&BlockId, &IndexEntry)> {
        self.entries.iter()
    }
}
