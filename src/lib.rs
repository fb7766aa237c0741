//! # KyroBlock - Block Serializer Write Path
//!
//! KyroBlock turns a batch of block writes into durable storage: the blocks
//! are written concurrently, and once every one of them is durable the whole
//! batch's index updates are committed atomically. Data is only referenced
//! by the index after that commit, so a crash mid-batch leaves nothing but
//! unreferenced extents that are reclaimed on recovery.
//!
//! ## Core Concepts
//!
//! - **Block Buffer**: one block's payload behind a checksummed header
//! - **Block Token**: shared handle to a block's physical location
//! - **Write Descriptor**: UPDATE, DELETE, or TOUCH of one block
//! - **Completion Barrier**: suspends the committing task until its writes land
//! - **Serializer**: the storage contract (in-memory or persistent)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use kyroblock::{commit_batch, BlockId, IoPriority, Recency, Serializer, SerializerWrite};
//! use kyroblock::storage::{InMemorySerializer, SerializerConfig};
//!
//! let ser = InMemorySerializer::new(SerializerConfig::default())?;
//! let account = ser.make_io_account(IoPriority::DEFAULT);
//!
//! let mut buf = ser.malloc();
//! buf.payload_mut()[..5].copy_from_slice(b"hello");
//!
//! commit_batch(
//!     &ser,
//!     vec![
//!         SerializerWrite::make_update(BlockId::new(1), Recency::new(5), Arc::new(buf)),
//!         SerializerWrite::make_delete(BlockId::new(2)),
//!         SerializerWrite::make_touch(BlockId::new(3), Recency::new(9)),
//!     ],
//!     &account,
//! )
//! .await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod block;
pub mod buffer;
pub mod error;
pub mod recency;
pub mod token;
pub mod write;

// Write path
pub mod completion;
pub mod io_account;
pub mod pipeline;
pub mod storage;

// Re-export primary types at crate root for convenience
pub use block::{BlockId, BlockSize};
pub use buffer::{BlockBuffer, BufferHeader, BufferPool, BufferSlot, HEADER_SIZE};
pub use completion::{
    completion_pair, gated_completion_pair, CompletionHandle, CompletionSink, LaunchGate, WriteBarrier,
    WriteOutcome,
};
pub use error::{ConfigError, KyroBlockError, KyroBlockResult};
pub use io_account::{IoAccount, IoAdmission, IoPriority, UNLIMITED_OUTSTANDING_REQUESTS};
pub use pipeline::{commit_batch, serializer_block_write};
pub use recency::Recency;
pub use token::BlockToken;
pub use write::{IoCallback, SerializerWrite, WriteAction, WriteKind, WriteLaunchedCallback};

pub use storage::{IndexEntry, IndexWriteOp, Serializer, StorageError};
