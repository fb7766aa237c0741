//! Storage backends for the write pipeline.
//!
//! [`Serializer`] is the contract the pipeline writes through. Two
//! implementations are provided:
//! - [`InMemorySerializer`] for tests and embedded use
//! - `persistent::PersistentSerializer` (feature `persistent`) for durable,
//!   crash-safe storage

mod traits;

pub mod extent;
pub mod index;
pub mod io_pool;
pub mod memory;

#[cfg(feature = "persistent")]
pub mod persistent;

pub use extent::ExtentAllocator;
pub use index::{BlockIndex, IndexSnapshot};
pub use io_pool::{DefaultIoRouter, IoPath, IoPoolConfig, IoRouter, IoScheduler, QueueSlot};
pub use memory::InMemorySerializer;
pub use traits::{BufWriteInfo, IndexEntry, IndexWriteOp, Serializer, StorageError, TokenUpdate};

#[cfg(feature = "persistent")]
pub use persistent::{open_serializer, PersistentConfig, PersistentSerializer};

pub(crate) use traits::lock_err;

use crate::block::BlockSize;
use crate::error::ConfigError;

/// Configuration shared by every serializer backend.
#[derive(Debug, Clone)]
pub struct SerializerConfig {
    /// Block size; the payload each buffer carries.
    pub block_size: BlockSize,
    /// Physical write scheduling.
    pub io: IoPoolConfig,
    /// Released buffers kept by the pool for reuse.
    pub max_cached_buffers: usize,
}

impl Default for SerializerConfig {
    fn default() -> Self {
        Self {
            block_size: BlockSize::default(),
            io: IoPoolConfig::default(),
            max_cached_buffers: 256,
        }
    }
}

impl SerializerConfig {
    /// Validates nested settings.
    pub fn validate(self) -> Result<Self, ConfigError> {
        let io = self.io.validate()?;
        Ok(Self { io, ..self })
    }
}
