//! Write descriptors: one requested operation on one block.

use std::fmt;
use std::sync::Arc;

use crate::block::BlockId;
use crate::buffer::BlockBuffer;
use crate::recency::Recency;
use crate::token::BlockToken;

/// Invoked once the physical write of an UPDATE is durable.
pub type IoCallback = Box<dyn FnOnce() + Send + 'static>;

/// Invoked once the physical write of an UPDATE has been accepted into flight.
///
/// Runs on the committing task, before the write completes, in dispatch order.
pub type WriteLaunchedCallback = Box<dyn FnOnce(&BlockToken) + Send + 'static>;

/// Discriminant of a [`WriteAction`], used for logging and stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteKind {
    /// New contents for the block.
    Update,
    /// Remove the block.
    Delete,
    /// Bump recency only.
    Touch,
}

/// What to do to the block.
pub enum WriteAction {
    /// Write `buf` as the block's new contents.
    Update {
        /// Contents to write; the payload must be exactly one block.
        buf: Arc<BlockBuffer>,
        /// Recency of the new version.
        recency: Recency,
        /// Fired when the physical write is durable.
        io_callback: Option<IoCallback>,
        /// Fired when the physical write is in flight.
        launch_callback: Option<WriteLaunchedCallback>,
    },
    /// Clear the block's token and recency.
    Delete,
    /// Change only the recency; contents and token stay as they are.
    Touch {
        /// New recency.
        recency: Recency,
    },
}

impl WriteAction {
    /// Returns the discriminant.
    #[must_use]
    pub const fn kind(&self) -> WriteKind {
        match self {
            Self::Update { .. } => WriteKind::Update,
            Self::Delete => WriteKind::Delete,
            Self::Touch { .. } => WriteKind::Touch,
        }
    }
}

impl fmt::Debug for WriteAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Update {
                buf,
                recency,
                io_callback,
                launch_callback,
            } => f
                .debug_struct("Update")
                .field("len", &buf.len())
                .field("recency", recency)
                .field("io_callback", &io_callback.is_some())
                .field("launch_callback", &launch_callback.is_some())
                .finish(),
            Self::Delete => f.write_str("Delete"),
            Self::Touch { recency } => f.debug_struct("Touch").field("recency", recency).finish(),
        }
    }
}

/// A requested write against one block identifier.
#[derive(Debug)]
pub struct SerializerWrite {
    /// Target block.
    pub block_id: BlockId,
    /// Requested operation.
    pub action: WriteAction,
}

impl SerializerWrite {
    /// UPDATE without callbacks.
    ///
    /// # Panics
    /// Panics if `buf` has an empty payload or `recency` is the invalid sentinel.
    #[must_use]
    pub fn make_update(block_id: BlockId, recency: Recency, buf: Arc<BlockBuffer>) -> Self {
        Self::make_update_with_callbacks(block_id, recency, buf, None, None)
    }

    /// UPDATE with optional completion and launch callbacks.
    ///
    /// # Panics
    /// Panics if `buf` has an empty payload or `recency` is the invalid sentinel.
    #[must_use]
    pub fn make_update_with_callbacks(
        block_id: BlockId,
        recency: Recency,
        buf: Arc<BlockBuffer>,
        io_callback: Option<IoCallback>,
        launch_callback: Option<WriteLaunchedCallback>,
    ) -> Self {
        assert!(!buf.is_empty(), "update of {block_id} with an empty buffer");
        assert!(recency.is_valid(), "update of {block_id} with invalid recency");
        Self {
            block_id,
            action: WriteAction::Update {
                buf,
                recency,
                io_callback,
                launch_callback,
            },
        }
    }

    /// DELETE.
    #[must_use]
    pub const fn make_delete(block_id: BlockId) -> Self {
        Self {
            block_id,
            action: WriteAction::Delete,
        }
    }

    /// TOUCH.
    #[must_use]
    pub const fn make_touch(block_id: BlockId, recency: Recency) -> Self {
        Self {
            block_id,
            action: WriteAction::Touch { recency },
        }
    }

    /// Returns the discriminant of the action.
    #[must_use]
    pub const fn kind(&self) -> WriteKind {
        self.action.kind()
    }
}
