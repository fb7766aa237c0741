//! Persistent storage backend.
//!
//! This module provides durable, crash-safe block storage with:
//! - An append-only index log, one checksummed frame per committed batch
//! - A fixed-extent data file holding the blocks
//! - File locking for single-process access
//! - Snapshot compaction of the index log
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    PersistentSerializer                       │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐                    │
//! │  │ IndexLog        │  │ DataFile        │                    │
//! │  │ (index.log)     │  │ (blocks.dat)    │                    │
//! │  └────────┬────────┘  └────────┬────────┘                    │
//! │           │                    │                             │
//! │           └──────────┬─────────┘                             │
//! │                      ↓                                       │
//! │           ┌─────────────────────┐                            │
//! │           │   FileLock (.lock)  │                            │
//! │           └─────────────────────┘                            │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod codec;
mod data_file;
mod file_lock;
mod index_log;
mod serializer;

pub use data_file::{DataFile, DATA_FILE};
pub use file_lock::{FileLock, LOCK_FILE};
pub use index_log::{IndexLog, IndexLogEntry, IndexLogKind, IndexOpRecord, SnapshotRecord, TokenRecord};
pub use serializer::{CompactionResult, PersistentSerializer, INDEX_LOG_FILE};

use std::path::Path;

use crate::error::{ConfigError, KyroBlockError};
use crate::storage::SerializerConfig;

/// Configuration for the persistent backend.
#[derive(Debug, Clone)]
pub struct PersistentConfig {
    /// Block size, I/O pools, and buffer caching.
    pub serializer: SerializerConfig,
    /// Whether to fsync block writes and index frames (slower but crash-safe).
    pub sync_on_write: bool,
    /// Index log size that triggers compaction (bytes).
    pub max_index_log_size: u64,
}

impl Default for PersistentConfig {
    fn default() -> Self {
        Self {
            serializer: SerializerConfig::default(),
            sync_on_write: true,
            max_index_log_size: 64 * 1024 * 1024, // 64 MB
        }
    }
}

impl PersistentConfig {
    const MIN_INDEX_LOG_SIZE: u64 = 4 * 1024; // 4 KiB minimum to avoid degenerate compaction loops

    /// Validates the configuration.
    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.max_index_log_size < Self::MIN_INDEX_LOG_SIZE {
            return Err(ConfigError::BelowMinimum {
                field: "max_index_log_size",
                min: Self::MIN_INDEX_LOG_SIZE,
                actual: self.max_index_log_size,
            });
        }
        let serializer = self.serializer.validate()?;
        Ok(Self { serializer, ..self })
    }
}

/// Opens or creates a persistent block store at the given path.
///
/// # Arguments
/// * `path` - Directory to store the database files
/// * `config` - Optional configuration (uses defaults if None)
///
/// # Errors
/// - If the path cannot be created or accessed
/// - If another process holds the lock
/// - If the index log is corrupted before its tail
///
/// # Example
/// ```rust,ignore
/// use kyroblock::storage::persistent::open_serializer;
///
/// let ser = open_serializer("./blocks.kyro", None)?;
/// kyroblock::commit_batch(&ser, writes, &ser.make_io_account(IoPriority::DEFAULT)).await?;
/// ```
pub fn open_serializer(
    path: impl AsRef<Path>,
    config: Option<PersistentConfig>,
) -> Result<PersistentSerializer, KyroBlockError> {
    PersistentSerializer::open(path.as_ref(), config.unwrap_or_default())
}
