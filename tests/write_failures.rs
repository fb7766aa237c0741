//! `commit_batch` against a serializer that fails, abandons or refuses writes.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kyroblock::storage::{BufWriteInfo, IndexSnapshot, InMemorySerializer, IoScheduler, SerializerConfig};
use kyroblock::{
    commit_batch, completion_pair, BlockBuffer, BlockId, BlockSize, BlockToken, BufferPool,
    CompletionSink, IndexEntry, IndexWriteOp, IoAccount, IoPriority, Recency, Serializer,
    SerializerWrite, StorageError,
};

#[derive(Debug, Clone, Copy)]
enum Fault {
    /// The nth physical write lands but reports an I/O error.
    FailWrite(usize),
    /// The nth write's sink is dropped without a signal.
    AbandonWrite(usize),
    /// The nth submission is refused outright.
    RefuseDispatch(usize),
    /// Every write is reported complete before `block_writes` returns.
    CompleteEagerly,
}

struct FaultySerializer {
    inner: InMemorySerializer,
    fault: Fault,
    submitted: AtomicUsize,
}

impl FaultySerializer {
    fn new(fault: Fault) -> Self {
        Self::with_inner(fault, memory())
    }

    fn with_inner(fault: Fault, inner: InMemorySerializer) -> Self {
        Self {
            inner,
            fault,
            submitted: AtomicUsize::new(0),
        }
    }
}

impl Serializer for FaultySerializer {
    fn block_size(&self) -> BlockSize {
        self.inner.block_size()
    }

    fn buffer_pool(&self) -> &BufferPool {
        self.inner.buffer_pool()
    }

    fn io_scheduler(&self) -> &IoScheduler {
        self.inner.io_scheduler()
    }

    fn block_writes(
        &self,
        writes: Vec<BufWriteInfo>,
        account: &IoAccount,
        sink: CompletionSink,
    ) -> Result<Vec<BlockToken>, StorageError> {
        let nth = self.submitted.fetch_add(1, Ordering::SeqCst);
        if matches!(self.fault, Fault::RefuseDispatch(at) if at == nth) {
            drop(sink);
            return Err(StorageError::Disconnected {
                path: "foreground".to_string(),
            });
        }

        let (inner_sink, mut inner) = completion_pair(None);
        let tokens = self.inner.block_writes(writes, account, inner_sink)?;
        match self.fault {
            Fault::CompleteEagerly => sink.complete(Ok(())),
            fault => {
                tokio::spawn(async move {
                    let outcome = inner.wait().await;
                    match fault {
                        Fault::FailWrite(at) if at == nth => sink.complete(Err(StorageError::io(
                            "write block",
                            &io::Error::new(io::ErrorKind::Other, "device gone"),
                        ))),
                        Fault::AbandonWrite(at) if at == nth => drop(sink),
                        _ => sink.complete(outcome),
                    }
                });
            }
        }
        Ok(tokens)
    }

    fn block_read(&self, token: &BlockToken, block_id: BlockId) -> Result<BlockBuffer, StorageError> {
        self.inner.block_read(token, block_id)
    }

    fn index_read(&self, block_id: BlockId) -> Result<Option<IndexEntry>, StorageError> {
        self.inner.index_read(block_id)
    }

    fn index_snapshot(&self) -> Result<IndexSnapshot, StorageError> {
        self.inner.index_snapshot()
    }

    fn index_write(
        &self,
        ops: Vec<IndexWriteOp>,
        account: &IoAccount,
        sink: CompletionSink,
    ) -> Result<(), StorageError> {
        self.inner.index_write(ops, account, sink)
    }
}

fn memory() -> InMemorySerializer {
    InMemorySerializer::new(SerializerConfig {
        block_size: BlockSize::from_value(128).unwrap(),
        ..SerializerConfig::default()
    })
    .unwrap()
}

fn updates(ser: &impl Serializer, blocks: std::ops::Range<u64>, recency: u64) -> Vec<SerializerWrite> {
    blocks
        .map(|block| {
            let mut buf = ser.malloc();
            buf.payload_mut().fill(block as u8);
            SerializerWrite::make_update(BlockId::new(block), Recency::new(recency), Arc::new(buf))
        })
        .collect()
}

#[tokio::test]
async fn test_failed_write_leaves_index_untouched() {
    let ser = FaultySerializer::new(Fault::FailWrite(2));
    let account = ser.make_io_account(IoPriority::DEFAULT);

    // Seeded through the inner serializer so the fault counter starts at zero.
    commit_batch(&ser.inner, updates(&ser, 1..2, 1), &account).await.unwrap();
    let before = ser.index_read(BlockId::new(1)).unwrap().unwrap();
    assert_eq!(ser.inner.stored_extents().unwrap(), 1);

    let mut writes = updates(&ser, 1..5, 2);
    writes.push(SerializerWrite::make_delete(BlockId::new(1)));
    let err = commit_batch(&ser, writes, &account).await.unwrap_err();
    assert!(matches!(err, StorageError::Io { .. }), "got {err:?}");

    let after = ser.index_read(BlockId::new(1)).unwrap().unwrap();
    assert_eq!(after.recency, Recency::new(1));
    assert!(after.token.unwrap().same_token(before.token.as_ref().unwrap()));
    assert_eq!(ser.index_snapshot().unwrap().len(), 1);

    // All four written blocks were garbage and have been reclaimed.
    assert_eq!(ser.inner.stored_extents().unwrap(), 1);
    assert_eq!(account.in_flight(), 0);
}

#[tokio::test]
async fn test_abandoned_write_fails_batch() {
    let ser = FaultySerializer::new(Fault::AbandonWrite(1));
    let account = ser.make_io_account(IoPriority::DEFAULT);

    let mut writes = updates(&ser, 0..3, 1);
    writes.push(SerializerWrite::make_touch(BlockId::new(9), Recency::new(4)));
    let err = commit_batch(&ser, writes, &account).await.unwrap_err();
    assert!(matches!(err, StorageError::WriteAbandoned), "got {err:?}");

    assert!(ser.index_snapshot().unwrap().is_empty());
    assert_eq!(ser.inner.stored_extents().unwrap(), 0);
    assert_eq!(account.in_flight(), 0);
}

/// A refused submission returns only after the writes already launched by
/// the batch have finished.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dispatch_failure_waits_for_in_flight_writes() {
    let inner = memory().with_write_latency(Duration::from_millis(30));
    let ser = FaultySerializer::with_inner(Fault::RefuseDispatch(2), inner);
    let account = ser.make_io_account(IoPriority::DEFAULT);
    let finished = Arc::new(AtomicUsize::new(0));

    let writes = (0..4u64)
        .map(|block| {
            let finished = Arc::clone(&finished);
            SerializerWrite::make_update_with_callbacks(
                BlockId::new(block),
                Recency::new(1),
                Arc::new(ser.malloc()),
                Some(Box::new(move || {
                    finished.fetch_add(1, Ordering::SeqCst);
                })),
                None,
            )
        })
        .collect();
    let err = commit_batch(&ser, writes, &account).await.unwrap_err();
    assert!(matches!(err, StorageError::Disconnected { .. }), "got {err:?}");

    assert_eq!(finished.load(Ordering::SeqCst), 2);
    assert_eq!(account.in_flight(), 0);
    assert!(ser.index_snapshot().unwrap().is_empty());
    assert_eq!(ser.inner.stored_extents().unwrap(), 0);
}

/// Even when storage finishes a write before `block_writes` returns, the
/// launch callback is observed first.
#[tokio::test]
async fn test_launch_callback_precedes_eager_completion() {
    let ser = FaultySerializer::new(Fault::CompleteEagerly);
    let account = ser.make_io_account(IoPriority::DEFAULT);
    let events = Arc::new(Mutex::new(Vec::new()));

    let writes = (0..3u64)
        .map(|block| {
            let on_io = {
                let events = Arc::clone(&events);
                Box::new(move || events.lock().unwrap().push(format!("io {block}")))
            };
            let on_launch = {
                let events = Arc::clone(&events);
                Box::new(move |_: &BlockToken| events.lock().unwrap().push(format!("launch {block}")))
            };
            SerializerWrite::make_update_with_callbacks(
                BlockId::new(block),
                Recency::new(1),
                Arc::new(ser.malloc()),
                Some(on_io),
                Some(on_launch),
            )
        })
        .collect();
    commit_batch(&ser, writes, &account).await.unwrap();

    assert_eq!(
        *events.lock().unwrap(),
        ["launch 0", "io 0", "launch 1", "io 1", "launch 2", "io 2"]
    );
}
