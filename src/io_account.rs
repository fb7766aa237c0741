//! I/O accounts: priority and admission control for physical writes.
//!
//! An account is shared by every batch that writes under it. Accounts with an
//! outstanding-request limit admit at most that many physical writes at once;
//! further writes suspend the committing task until an earlier write
//! completes. Unrelated batches are never serialized by the account itself.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Sentinel limit meaning "no admission control".
pub const UNLIMITED_OUTSTANDING_REQUESTS: usize = usize::MAX;

/// Scheduling priority of an account. Higher is more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IoPriority(u8);

impl IoPriority {
    /// Background work such as compaction and garbage collection.
    pub const BACKGROUND: Self = Self(10);
    /// Regular foreground writes.
    pub const DEFAULT: Self = Self(50);
    /// Latency-sensitive writes.
    pub const HIGH: Self = Self(100);

    /// Creates a priority from its raw value.
    #[must_use]
    pub const fn new(raw: u8) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn get(self) -> u8 {
        self.0
    }
}

impl Default for IoPriority {
    fn default() -> Self {
        Self::DEFAULT
    }
}

struct AccountInner {
    priority: IoPriority,
    limit: Option<usize>,
    permits: Option<Arc<Semaphore>>,
    submitted: AtomicU64,
    completed: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

/// Shared handle to an I/O account.
#[derive(Clone)]
pub struct IoAccount {
    inner: Arc<AccountInner>,
}

impl IoAccount {
    /// Creates an account admitting at most `outstanding_limit` writes at once.
    ///
    /// Pass [`UNLIMITED_OUTSTANDING_REQUESTS`] for no limit.
    ///
    /// # Panics
    /// Panics if `outstanding_limit` is zero; such an account could never admit a write.
    #[must_use]
    pub fn new(priority: IoPriority, outstanding_limit: usize) -> Self {
        assert!(outstanding_limit > 0, "io account with zero outstanding requests");
        let limit = (outstanding_limit != UNLIMITED_OUTSTANDING_REQUESTS
            && outstanding_limit <= Semaphore::MAX_PERMITS)
            .then_some(outstanding_limit);
        Self {
            inner: Arc::new(AccountInner {
                priority,
                limit,
                permits: limit.map(|n| Arc::new(Semaphore::new(n))),
                submitted: AtomicU64::new(0),
                completed: AtomicU64::new(0),
                in_flight: AtomicUsize::new(0),
                peak_in_flight: AtomicUsize::new(0),
            }),
        }
    }

    /// Creates an account without admission control.
    #[must_use]
    pub fn unlimited(priority: IoPriority) -> Self {
        Self::new(priority, UNLIMITED_OUTSTANDING_REQUESTS)
    }

    /// Waits until the account admits one more physical write.
    ///
    /// The returned admission must be held until the write completes.
    pub async fn admit(&self) -> IoAdmission {
        let permit = match &self.inner.permits {
            // The semaphore is never closed, so acquisition only fails if that changes.
            Some(sem) => Arc::clone(sem).acquire_owned().await.ok(),
            None => None,
        };
        self.inner.submitted.fetch_add(1, Ordering::Relaxed);
        let now = self.inner.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.inner.peak_in_flight.fetch_max(now, Ordering::AcqRel);
        IoAdmission {
            account: self.clone(),
            _permit: permit,
        }
    }

    /// Scheduling priority.
    #[must_use]
    pub fn priority(&self) -> IoPriority {
        self.inner.priority
    }

    /// Outstanding-request limit, `None` if unlimited.
    #[must_use]
    pub fn outstanding_limit(&self) -> Option<usize> {
        self.inner.limit
    }

    /// Writes admitted so far.
    #[must_use]
    pub fn submitted(&self) -> u64 {
        self.inner.submitted.load(Ordering::Relaxed)
    }

    /// Writes whose admission has been released.
    #[must_use]
    pub fn completed(&self) -> u64 {
        self.inner.completed.load(Ordering::Relaxed)
    }

    /// Writes currently admitted and not yet completed.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Highest number of simultaneously admitted writes observed.
    #[must_use]
    pub fn peak_in_flight(&self) -> usize {
        self.inner.peak_in_flight.load(Ordering::Acquire)
    }
}

impl fmt::Debug for IoAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoAccount")
            .field("priority", &self.inner.priority)
            .field("limit", &self.inner.limit)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// Proof that a write was admitted. Dropping it frees the slot.
pub struct IoAdmission {
    account: IoAccount,
    _permit: Option<OwnedSemaphorePermit>,
}

impl Drop for IoAdmission {
    fn drop(&mut self) {
        let inner = &self.account.inner;
        inner.in_flight.fetch_sub(1, Ordering::AcqRel);
        inner.completed.fetch_add(1, Ordering::Relaxed);
    }
}

impl fmt::Debug for IoAdmission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoAdmission")
            .field("priority", &self.account.priority())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_unlimited_account_counts() {
        let account = IoAccount::unlimited(IoPriority::DEFAULT);
        assert_eq!(account.outstanding_limit(), None);

        let a = account.admit().await;
        let b = account.admit().await;
        assert_eq!(account.in_flight(), 2);
        drop(a);
        drop(b);
        assert_eq!(account.in_flight(), 0);
        assert_eq!(account.submitted(), 2);
        assert_eq!(account.completed(), 2);
        assert_eq!(account.peak_in_flight(), 2);
    }

    #[tokio::test]
    async fn test_limited_account_blocks_until_release() {
        let account = IoAccount::new(IoPriority::BACKGROUND, 1);
        let first = account.admit().await;

        let second = tokio::time::timeout(Duration::from_millis(50), account.admit()).await;
        assert!(second.is_err(), "second admission must wait for the first");

        drop(first);
        let _second = tokio::time::timeout(Duration::from_secs(1), account.admit())
            .await
            .unwrap();
        assert_eq!(account.peak_in_flight(), 1);
    }

    #[test]
    #[should_panic(expected = "zero outstanding")]
    fn test_zero_limit_panics() {
        let _ = IoAccount::new(IoPriority::DEFAULT, 0);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(IoPriority::BACKGROUND < IoPriority::DEFAULT);
        assert!(IoPriority::DEFAULT < IoPriority::HIGH);
        assert_eq!(IoPriority::default(), IoPriority::DEFAULT);
    }
}
