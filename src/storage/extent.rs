//! Extent allocator issuing block tokens.
//!
//! The backing store is an array of fixed-size extents, one block each.
//! Extent `n` lives at byte offset `n * extent_size`. Dropped tokens report
//! their offset over a channel; reclaimed offsets are reused lowest first.

use std::collections::{BTreeSet, HashSet};

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::token::BlockToken;

/// Hands out extents and recycles the ones whose tokens were dropped.
#[derive(Debug)]
pub struct ExtentAllocator {
    extent_size: u64,
    next_offset: u64,
    free: BTreeSet<u64>,
    reclaim_tx: Sender<u64>,
    reclaim_rx: Receiver<u64>,
}

impl ExtentAllocator {
    /// Creates an allocator over an empty store.
    #[must_use]
    pub fn new(extent_size: u32) -> Self {
        let (reclaim_tx, reclaim_rx) = unbounded();
        Self {
            extent_size: u64::from(extent_size),
            next_offset: 0,
            free: BTreeSet::new(),
            reclaim_tx,
            reclaim_rx,
        }
    }

    /// Rebuilds the allocator after recovery.
    ///
    /// Every extent below `high_water_extents` that is not in `in_use` is free:
    /// it held either a deleted block or a block whose batch never committed.
    #[must_use]
    pub fn recover(extent_size: u32, high_water_extents: u64, in_use: &HashSet<u64>) -> Self {
        let mut alloc = Self::new(extent_size);
        alloc.next_offset = high_water_extents * alloc.extent_size;
        alloc.free = (0..high_water_extents)
            .map(|n| n * alloc.extent_size)
            .filter(|offset| !in_use.contains(offset))
            .collect();
        alloc
    }

    /// Issues a token for a free extent.
    pub fn issue(&mut self) -> BlockToken {
        self.collect_reclaimed();
        let offset = self.free.pop_first().unwrap_or_else(|| {
            let offset = self.next_offset;
            self.next_offset += self.extent_size;
            offset
        });
        self.token_at(offset)
    }

    /// Issues a token for an extent recovered as in use.
    ///
    /// # Panics
    /// Panics if the extent is currently free or lies past the high-water mark.
    pub fn adopt(&mut self, offset: u64) -> BlockToken {
        assert!(offset < self.next_offset, "adopted extent {offset} past high water");
        assert!(!self.free.contains(&offset), "adopted extent {offset} is free");
        self.token_at(offset)
    }

    /// Moves offsets of dropped tokens to the free set and returns them.
    pub fn collect_reclaimed(&mut self) -> Vec<u64> {
        let reclaimed: Vec<u64> = self.reclaim_rx.try_iter().collect();
        for offset in &reclaimed {
            let fresh = self.free.insert(*offset);
            assert!(fresh, "extent {offset} reclaimed twice");
        }
        reclaimed
    }

    /// Number of free extents below the high-water mark.
    #[must_use]
    pub fn free_extents(&self) -> usize {
        self.free.len()
    }

    /// Byte offset one past the highest extent ever issued.
    #[must_use]
    pub const fn high_water(&self) -> u64 {
        self.next_offset
    }

    /// Size of one extent in bytes.
    #[must_use]
    pub const fn extent_size(&self) -> u64 {
        self.extent_size
    }

    fn token_at(&self, offset: u64) -> BlockToken {
        #[allow(clippy::cast_possible_truncation)]
        let size = self.extent_size as u32;
        BlockToken::issue(offset, size, self.reclaim_tx.clone())
    }
}
