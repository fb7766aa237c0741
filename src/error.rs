//! Error types for KyroBlock.
//!
//! Errors here describe environmental failures only: bad configuration and
//! backend I/O. Caller contract violations (wrong block size, double free,
//! double signal) are panics and never show up as values of these types.

use thiserror::Error;

use crate::storage::StorageError;

/// Configuration errors reported by `validate()` on the config structs.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Block size {value} is out of range [{min}, {max}]")]
    BlockSizeOutOfRange {
        value: u32,
        min: u32,
        max: u32,
    },

    #[error("Configured block size {configured} does not match stored block size {stored}")]
    BlockSizeMismatch {
        configured: u32,
        stored: u32,
    },

    #[error("Field '{field}' must be non-zero")]
    ZeroField {
        field: &'static str,
    },

    #[error("Field '{field}' must be at least {min} (got {actual})")]
    BelowMinimum {
        field: &'static str,
        min: u64,
        actual: u64,
    },
}

/// Top-level error type for KyroBlock.
#[derive(Debug, Error)]
pub enum KyroBlockError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl KyroBlockError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a configuration error.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Returns true if this is a storage error.
    #[must_use]
    pub const fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }

    /// Returns true if this error is retryable.
    ///
    /// Lock contention on open and a full I/O queue are worth retrying;
    /// corruption and configuration problems won't change on retry.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Config(_) | Self::Internal { .. } => false,
            Self::Storage(e) => matches!(e, StorageError::Locked { .. } | StorageError::QueueFull { .. }),
        }
    }
}

/// Result type alias for KyroBlock operations.
pub type KyroBlockResult<T> = Result<T, KyroBlockError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_block_size() {
        let err = ConfigError::BlockSizeOutOfRange {
            value: 16,
            min: 64,
            max: 1024,
        };
        let msg = format!("{err}");
        assert!(msg.contains("16"));
        assert!(msg.contains("out of range"));
    }

    #[test]
    fn test_config_error_below_minimum() {
        let err = ConfigError::BelowMinimum {
            field: "max_index_log_size",
            min: 4096,
            actual: 10,
        };
        let msg = format!("{err}");
        assert!(msg.contains("max_index_log_size"));
        assert!(msg.contains("4096"));
    }

    #[test]
    fn test_error_from_config() {
        let err: KyroBlockError = ConfigError::ZeroField { field: "foreground_workers" }.into();
        assert!(err.is_config());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_error_from_storage() {
        let err: KyroBlockError = StorageError::Locked {
            message: "held by pid 42".to_string(),
        }
        .into();
        assert!(err.is_storage());
        assert!(err.is_retryable());

        let err: KyroBlockError = StorageError::Corruption {
            message: "bad frame".to_string(),
        }
        .into();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_internal_error() {
        let err = KyroBlockError::internal("unexpected state");
        assert!(!err.is_retryable());
        assert!(format!("{err}").contains("unexpected state"));
    }
}
