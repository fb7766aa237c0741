//! Completion handles for in-flight physical writes.
//!
//! Each physical write gets a [`CompletionSink`] / [`CompletionHandle`] pair.
//! The sink goes to the storage layer and is signaled exactly once when the
//! write is durable (or has failed); the handle is a single-shot latch the
//! committing task awaits. Waiting suspends only the awaiting task.
//!
//! A [`WriteBarrier`] collects the handles of one batch and resolves once all
//! of them have signaled. Handles are consumed by the barrier and cannot be
//! reused.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;

use crate::io_account::IoAdmission;
use crate::storage::io_pool::QueueSlot;
use crate::storage::StorageError;
use crate::write::IoCallback;

/// Result of one physical write.
pub type WriteOutcome = Result<(), StorageError>;

/// Creates a linked sink/handle pair.
///
/// `callback` runs when the sink is signaled, before waiters are released.
#[must_use]
pub fn completion_pair(callback: Option<IoCallback>) -> (CompletionSink, CompletionHandle) {
    let (shared, handle) = Rendezvous::new(callback, 1);
    (CompletionSink::new(shared), handle)
}

/// Like [`completion_pair`], but the completion is also held back until the
/// returned [`LaunchGate`] is opened.
///
/// The storage layer may finish the write at any time; the callback and the
/// waiters only see it once the gate is open as well.
#[must_use]
pub fn gated_completion_pair(
    callback: Option<IoCallback>,
) -> (CompletionSink, LaunchGate, CompletionHandle) {
    let (shared, handle) = Rendezvous::new(callback, 2);
    let gate = LaunchGate {
        shared: Arc::clone(&shared),
        opened: false,
    };
    (CompletionSink::new(shared), gate, handle)
}

struct Signal {
    tx: watch::Sender<Option<WriteOutcome>>,
    callback: Option<IoCallback>,
    admission: Option<IoAdmission>,
    queue_slot: Option<QueueSlot>,
}

impl Signal {
    fn fire(mut self, outcome: WriteOutcome) {
        if let Some(callback) = self.callback.take() {
            callback();
        }
        drop(self.admission.take());
        drop(self.queue_slot.take());
        self.tx.send_replace(Some(outcome));
    }
}

/// Fires the signal once every party (the sink, plus the gate if any) has arrived.
struct Rendezvous {
    pending: AtomicUsize,
    outcome: Mutex<Option<WriteOutcome>>,
    signal: Mutex<Option<Signal>>,
}

impl Rendezvous {
    fn new(callback: Option<IoCallback>, parties: usize) -> (Arc<Self>, CompletionHandle) {
        let (tx, rx) = watch::channel(None);
        let shared = Arc::new(Self {
            pending: AtomicUsize::new(parties),
            outcome: Mutex::new(None),
            signal: Mutex::new(Some(Signal {
                tx,
                callback,
                admission: None,
                queue_slot: None,
            })),
        });
        (shared, CompletionHandle { rx })
    }

    fn with_signal(&self, f: impl FnOnce(&mut Signal)) {
        let mut signal = self.signal.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(signal) = signal.as_mut() {
            f(signal);
        }
    }

    fn arrive(&self) {
        let prev = self.pending.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "completion signaled after it fired");
        if prev == 1 {
            let signal = self.signal.lock().unwrap_or_else(PoisonError::into_inner).take();
            let outcome = self
                .outcome
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
                .unwrap_or(Err(StorageError::WriteAbandoned));
            if let Some(signal) = signal {
                signal.fire(outcome);
            }
        }
    }
}

/// Storage-side end of a completion: signaled exactly once.
///
/// A sink dropped without being completed signals
/// [`StorageError::WriteAbandoned`], so waiters never hang.
pub struct CompletionSink {
    shared: Arc<Rendezvous>,
    signaled: bool,
}

impl CompletionSink {
    fn new(shared: Arc<Rendezvous>) -> Self {
        Self {
            shared,
            signaled: false,
        }
    }

    /// Ties an account admission to this write; it is released on signal.
    pub fn hold_admission(&mut self, admission: IoAdmission) {
        self.shared.with_signal(|signal| {
            assert!(signal.admission.is_none(), "completion sink already holds an admission");
            signal.admission = Some(admission);
        });
    }

    /// Ties a reserved I/O queue slot to this write; it is released on signal.
    pub fn hold_queue_slot(&mut self, slot: QueueSlot) {
        self.shared.with_signal(|signal| {
            assert!(signal.queue_slot.is_none(), "completion sink already holds a queue slot");
            signal.queue_slot = Some(slot);
        });
    }

    /// Signals the outcome of the write.
    pub fn complete(mut self, outcome: WriteOutcome) {
        self.signal(outcome);
    }

    fn signal(&mut self, outcome: WriteOutcome) {
        assert!(!self.signaled, "completion sink signaled twice");
        self.signaled = true;
        *self.shared.outcome.lock().unwrap_or_else(PoisonError::into_inner) = Some(outcome);
        self.shared.arrive();
    }
}

impl Drop for CompletionSink {
    fn drop(&mut self) {
        if !self.signaled {
            tracing::warn!("completion sink dropped before the write was signaled");
            self.signal(Err(StorageError::WriteAbandoned));
        }
    }
}

impl fmt::Debug for CompletionSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionSink")
            .field("signaled", &self.signaled)
            .finish_non_exhaustive()
    }
}

/// Second party of a [`gated_completion_pair`]. Dropping it opens it.
pub struct LaunchGate {
    shared: Arc<Rendezvous>,
    opened: bool,
}

impl LaunchGate {
    /// Lets the completion through once the write has finished too.
    pub fn open(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.opened {
            self.opened = true;
            self.shared.arrive();
        }
    }
}

impl Drop for LaunchGate {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for LaunchGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaunchGate").field("opened", &self.opened).finish()
    }
}

/// Waiting end of a completion. Clones wait on the same latch.
#[derive(Clone)]
pub struct CompletionHandle {
    rx: watch::Receiver<Option<WriteOutcome>>,
}

impl CompletionHandle {
    /// Suspends until the write has been signaled and returns its outcome.
    pub async fn wait(&mut self) -> WriteOutcome {
        match self.rx.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone().unwrap_or(Err(StorageError::WriteAbandoned)),
            Err(_) => Err(StorageError::WriteAbandoned),
        }
    }

    /// Returns true once the write has been signaled.
    #[must_use]
    pub fn is_signaled(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Outcome if already signaled.
    #[must_use]
    pub fn try_outcome(&self) -> Option<WriteOutcome> {
        self.rx.borrow().clone()
    }
}

impl fmt::Debug for CompletionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionHandle")
            .field("signaled", &self.is_signaled())
            .finish()
    }
}

/// All completion handles of one batch.
#[derive(Debug, Default)]
pub struct WriteBarrier {
    handles: Vec<CompletionHandle>,
}

impl WriteBarrier {
    /// Creates an empty barrier with room for `capacity` handles.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            handles: Vec::with_capacity(capacity),
        }
    }

    /// Adds the handle of a dispatched write.
    pub fn push(&mut self, handle: CompletionHandle) {
        self.handles.push(handle);
    }

    /// Number of writes the barrier waits on.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Returns true if nothing was dispatched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Waits for every write, in any order, then releases the handles.
    ///
    /// Always waits for all of them, even after a failure; returns the first
    /// failure seen.
    pub async fn wait_all(self) -> WriteOutcome {
        let mut first_err = None;
        for mut handle in self.handles {
            if let Err(err) = handle.wait().await {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// Fans several physical writes into one sink.
///
/// The sink is signaled when the last write finishes, with the first failure
/// if any write failed.
pub struct CompletionGroup {
    remaining: AtomicUsize,
    sink: Mutex<Option<CompletionSink>>,
    error: Mutex<Option<StorageError>>,
}

impl CompletionGroup {
    /// Creates a group for `writes` writes. With zero writes the sink is
    /// signaled immediately.
    #[must_use]
    pub fn new(sink: CompletionSink, writes: usize) -> Arc<Self> {
        if writes == 0 {
            sink.complete(Ok(()));
            return Arc::new(Self {
                remaining: AtomicUsize::new(0),
                sink: Mutex::new(None),
                error: Mutex::new(None),
            });
        }
        Arc::new(Self {
            remaining: AtomicUsize::new(writes),
            sink: Mutex::new(Some(sink)),
            error: Mutex::new(None),
        })
    }

    /// Records one finished write.
    pub fn finish(&self, outcome: WriteOutcome) {
        if let Err(err) = outcome {
            self.error
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get_or_insert(err);
        }
        let prev = self.remaining.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "completion group finished more writes than it was created for");
        if prev == 1 {
            let sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner).take();
            let err = self.error.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(sink) = sink {
                sink.complete(err.map_or(Ok(()), Err));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[tokio::test]
    async fn test_sink_runs_callback_then_releases_waiter() {
        let fired = Arc::new(AtomicBool::new(false));
        let seen = Arc::clone(&fired);
        let (sink, mut handle) = completion_pair(Some(Box::new(move || {
            seen.store(true, Ordering::SeqCst);
        })));
        assert!(!handle.is_signaled());

        sink.complete(Ok(()));
        assert!(handle.wait().await.is_ok());
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_waitable_many_times() {
        let (sink, mut handle) = completion_pair(None);
        let mut other = handle.clone();
        sink.complete(Err(StorageError::BackendError("disk gone".to_string())));
        assert!(handle.wait().await.is_err());
        assert!(other.wait().await.is_err());
        assert!(matches!(handle.try_outcome(), Some(Err(_))));
    }

    #[tokio::test]
    async fn test_dropped_sink_signals_abandoned() {
        let (sink, mut handle) = completion_pair(None);
        drop(sink);
        assert!(matches!(handle.wait().await, Err(StorageError::WriteAbandoned)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_barrier_waits_for_all() {
        let mut barrier = WriteBarrier::with_capacity(3);
        let mut sinks = Vec::new();
        for _ in 0..3 {
            let (sink, handle) = completion_pair(None);
            barrier.push(handle);
            sinks.push(sink);
        }
        assert_eq!(barrier.len(), 3);

        std::thread::spawn(move || {
            // Signal out of order from a plain thread.
            for sink in sinks.into_iter().rev() {
                std::thread::sleep(Duration::from_millis(5));
                sink.complete(Ok(()));
            }
        });

        tokio::time::timeout(Duration::from_secs(5), barrier.wait_all())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_barrier_reports_first_failure_after_all() {
        let mut barrier = WriteBarrier::default();
        let (ok_sink, h1) = completion_pair(None);
        let (bad_sink, h2) = completion_pair(None);
        barrier.push(h1);
        barrier.push(h2);
        bad_sink.complete(Err(StorageError::BackendError("boom".to_string())));
        ok_sink.complete(Ok(()));
        let err = barrier.wait_all().await.unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn test_group_signals_after_last_write() {
        let (sink, mut handle) = completion_pair(None);
        let group = CompletionGroup::new(sink, 2);
        group.finish(Ok(()));
        assert!(!handle.is_signaled());
        group.finish(Err(StorageError::BackendError("second".to_string())));
        assert!(handle.wait().await.is_err());
    }

    #[tokio::test]
    async fn test_gate_holds_back_finished_write() {
        let fired = Arc::new(AtomicBool::new(false));
        let seen = Arc::clone(&fired);
        let (sink, gate, mut handle) = gated_completion_pair(Some(Box::new(move || {
            seen.store(true, Ordering::SeqCst);
        })));

        sink.complete(Ok(()));
        assert!(!handle.is_signaled());
        assert!(!fired.load(Ordering::SeqCst));

        gate.open();
        assert!(fired.load(Ordering::SeqCst));
        assert!(handle.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_open_gate_waits_for_write() {
        let (sink, gate, mut handle) = gated_completion_pair(None);
        gate.open();
        assert!(!handle.is_signaled());
        sink.complete(Err(StorageError::BackendError("late".to_string())));
        assert!(handle.wait().await.is_err());
    }

    #[tokio::test]
    async fn test_dropped_gate_opens() {
        let (sink, gate, mut handle) = gated_completion_pair(None);
        drop(gate);
        drop(sink);
        assert!(matches!(handle.wait().await, Err(StorageError::WriteAbandoned)));
    }

    #[tokio::test]
    async fn test_empty_group_signals_immediately() {
        let (sink, mut handle) = completion_pair(None);
        let _group = CompletionGroup::new(sink, 0);
        assert!(handle.wait().await.is_ok());
    }
}
