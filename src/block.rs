//! Block identity and block size.
//!
//! A block has two sizes: the payload the buffer cache sees (`value`) and the
//! on-disk block (`ser_value`), which is the payload prefixed with a
//! [`BufferHeader`](crate::buffer::BufferHeader).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::buffer::HEADER_SIZE;
use crate::error::ConfigError;

/// Stable logical key for a block.
///
/// Unique within one serializer and never reused while the block is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(u64);

impl BlockId {
    /// Creates a block identifier from its raw value.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for BlockId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block#{}", self.0)
    }
}

/// Size of one block, tracked as its serialized (on-disk) size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockSize {
    ser_value: u32,
}

impl BlockSize {
    /// Smallest accepted payload size.
    pub const MIN_VALUE: u32 = 64;
    /// Largest accepted payload size (16 MiB).
    pub const MAX_VALUE: u32 = 16 * 1024 * 1024;

    /// Builds a block size from the payload size the buffer cache works with.
    pub fn from_value(value: u32) -> Result<Self, ConfigError> {
        if !(Self::MIN_VALUE..=Self::MAX_VALUE).contains(&value) {
            return Err(ConfigError::BlockSizeOutOfRange {
                value,
                min: Self::MIN_VALUE,
                max: Self::MAX_VALUE,
            });
        }
        Ok(Self {
            ser_value: value + HEADER_SIZE as u32,
        })
    }

    /// Builds a block size from the on-disk block size.
    pub fn from_ser_value(ser_value: u32) -> Result<Self, ConfigError> {
        let value = ser_value.saturating_sub(HEADER_SIZE as u32);
        Self::from_value(value)
    }

    /// Payload bytes per block.
    #[must_use]
    pub const fn value(self) -> u32 {
        self.ser_value - HEADER_SIZE as u32
    }

    /// On-disk bytes per block, header included.
    #[must_use]
    pub const fn ser_value(self) -> u32 {
        self.ser_value
    }
}

impl Default for BlockSize {
    fn default() -> Self {
        // 4 KiB payload
        Self {
            ser_value: 4096 + HEADER_SIZE as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_id_display() {
        assert_eq!(BlockId::new(7).to_string(), "block#7");
        assert_eq!(BlockId::from(9).get(), 9);
    }

    #[test]
    fn test_block_size_ser_value_includes_header() {
        let size = BlockSize::from_value(4096).unwrap();
        assert_eq!(size.value(), 4096);
        assert_eq!(size.ser_value(), 4096 + HEADER_SIZE as u32);
        assert_eq!(BlockSize::from_ser_value(size.ser_value()).unwrap(), size);
        assert_eq!(BlockSize::default(), size);
    }

    #[test]
    fn test_block_size_bounds() {
        assert!(BlockSize::from_value(BlockSize::MIN_VALUE - 1).is_err());
        assert!(BlockSize::from_value(BlockSize::MAX_VALUE + 1).is_err());
        assert!(BlockSize::from_ser_value(3).is_err());
    }
}
