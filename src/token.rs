//! Block tokens: shared handles to a block's physical location.
//!
//! Tokens are issued only by a serializer's extent allocator after it accepts
//! a physical write. Every clone shares one immutable payload; when the last
//! clone is dropped the extent offset is sent back to the allocator, which may
//! then reuse the space.

use std::fmt;
use std::sync::Arc;

use crossbeam_channel::Sender;

struct TokenInner {
    offset: u64,
    size: u32,
    reclaim: Option<Sender<u64>>,
}

impl Drop for TokenInner {
    fn drop(&mut self) {
        if let Some(tx) = self.reclaim.take() {
            // The allocator may already be gone during shutdown; nothing to reclaim then.
            let _ = tx.send(self.offset);
        }
    }
}

/// Reference-counted handle to a block's physical location and size.
#[derive(Clone)]
pub struct BlockToken {
    inner: Arc<TokenInner>,
}

impl BlockToken {
    pub(crate) fn issue(offset: u64, size: u32, reclaim: Sender<u64>) -> Self {
        Self {
            inner: Arc::new(TokenInner {
                offset,
                size,
                reclaim: Some(reclaim),
            }),
        }
    }

    /// Byte offset of the block in the backing store.
    #[must_use]
    pub fn location(&self) -> u64 {
        self.inner.offset
    }

    /// On-disk size of the block, header included.
    #[must_use]
    pub fn size(&self) -> u32 {
        self.inner.size
    }

    /// Number of live handles sharing this token.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Returns true if both handles refer to the same issued token.
    #[must_use]
    pub fn same_token(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for BlockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockToken")
            .field("location", &self.inner.offset)
            .field("size", &self.inner.size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    #[test]
    fn test_last_drop_reclaims() {
        let (tx, rx) = unbounded();
        let token = BlockToken::issue(4096, 4108, tx);
        let held = token.clone();
        assert_eq!(token.ref_count(), 2);
        assert!(token.same_token(&held));

        drop(token);
        assert!(rx.try_recv().is_err());

        drop(held);
        assert_eq!(rx.try_recv().unwrap(), 4096);
    }

    #[test]
    fn test_accessors() {
        let (tx, _rx) = unbounded();
        let token = BlockToken::issue(8192, 100, tx);
        assert_eq!(token.location(), 8192);
        assert_eq!(token.size(), 100);
    }

    #[test]
    fn test_drop_after_allocator_gone() {
        let (tx, rx) = unbounded();
        let token = BlockToken::issue(0, 1, tx);
        drop(rx);
        drop(token);
    }
}
