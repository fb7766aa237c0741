//! Recency timestamps attached to block versions.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Replication timestamp of a block version.
///
/// Ordered, used for replication and MVCC-style conflict resolution.
/// [`Recency::INVALID`] marks "no data", which is what a deleted block carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Recency(u64);

impl Recency {
    /// Sentinel for "no data".
    pub const INVALID: Self = Self(u64::MAX);

    /// Earliest valid recency.
    pub const DISTANT_PAST: Self = Self(0);

    /// Creates a recency from a raw timestamp.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw timestamp.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Returns true unless this is the [`Recency::INVALID`] sentinel.
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != u64::MAX
    }

    /// The recency immediately after this one.
    ///
    /// # Panics
    /// Panics when called on [`Recency::INVALID`] or on the last valid value.
    #[must_use]
    pub fn next(self) -> Self {
        assert!(self.0 < u64::MAX - 1, "recency overflow from {}", self.0);
        Self(self.0 + 1)
    }
}

impl fmt::Display for Recency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{}", self.0)
        } else {
            f.write_str("invalid")
        }
    }
}
