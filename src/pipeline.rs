//! Batch committer: dispatch, barrier, atomic index commit.
//!
//! ```text
//! commit_batch(writes)
//!   ├─ dispatch   UPDATE → admit, reserve queue slot, block_writes,
//!   │                      on-launch callback, open launch gate
//!   │             DELETE → clear op
//!   │             TOUCH  → recency-only op
//!   ├─ barrier    await every physical write of the batch
//!   └─ commit     index_write(all ops, in input order), await its sink
//! ```
//!
//! Every wait is an `.await`: admission, queue slots, the barrier and the
//! index commit suspend the committing task and never its thread.
//!
//! Data is only referenced after its index entry is committed. If the task
//! stops anywhere before the commit, the blocks it wrote are referenced only
//! by tokens that are dropped with it, and their extents are reclaimed.

use std::sync::Arc;

use crate::block::BlockId;
use crate::buffer::BlockBuffer;
use crate::completion::{completion_pair, gated_completion_pair, CompletionHandle, LaunchGate, WriteBarrier};
use crate::io_account::IoAccount;
use crate::storage::{BufWriteInfo, IndexWriteOp, Serializer, StorageError};
use crate::token::BlockToken;
use crate::write::{IoCallback, SerializerWrite, WriteAction};

/// Writes a batch of blocks and commits their index updates atomically.
///
/// Physical writes of the batch proceed concurrently; the calling task is
/// suspended until all of them are durable, then every index update is
/// applied in input order as one atomic `index_write`. Two UPDATEs of the
/// same block resolve to the later one.
///
/// # Errors
/// Returns the backend's error if a physical write or the index commit
/// fails. When a physical write fails the index is left untouched.
///
/// # Panics
/// Panics if an UPDATE buffer is not exactly one block of `ser`'s size.
pub async fn commit_batch<S>(
    ser: &S,
    writes: Vec<SerializerWrite>,
    account: &IoAccount,
) -> Result<(), StorageError>
where
    S: Serializer + ?Sized,
{
    let batch_len = writes.len();
    let mut ops = Vec::with_capacity(batch_len);
    let mut barrier = WriteBarrier::with_capacity(batch_len);

    for write in writes {
        let SerializerWrite { block_id, action } = write;
        match action {
            WriteAction::Update {
                buf,
                recency,
                io_callback,
                launch_callback,
            } => {
                let launched = dispatch_update(ser, buf, block_id, io_callback, account).await;
                let (token, gate, handle) = match launched {
                    Ok(launched) => launched,
                    Err(err) => {
                        // Writes already in flight still hold extents and admissions.
                        let _ = barrier.wait_all().await;
                        tracing::warn!(%block_id, error = %err, "batch dispatch failed");
                        return Err(err);
                    }
                };
                barrier.push(handle);
                if let Some(callback) = launch_callback {
                    callback(&token);
                }
                gate.open();
                ops.push(IndexWriteOp::assign(block_id, token, recency));
            }
            WriteAction::Delete => ops.push(IndexWriteOp::clear(block_id)),
            WriteAction::Touch { recency } => ops.push(IndexWriteOp::touch(block_id, recency)),
        }
    }

    let physical = barrier.len();
    if let Err(err) = barrier.wait_all().await {
        tracing::warn!(physical, error = %err, "physical write failed; batch not committed");
        return Err(err);
    }

    let slot = ser.io_scheduler().reserve(account.priority()).await?;
    let (mut sink, mut committed) = completion_pair(None);
    sink.hold_queue_slot(slot);
    ser.index_write(ops, account, sink)?;
    committed.wait().await?;
    tracing::debug!(writes = batch_len, physical, "committed batch");
    Ok(())
}

/// Writes one block and returns its token once the write is durable.
///
/// The index is not touched: the caller commits the token itself.
///
/// # Panics
/// Panics if `buf` is not exactly one block of `ser`'s size.
pub async fn serializer_block_write<S>(
    ser: &S,
    buf: Arc<BlockBuffer>,
    block_id: BlockId,
    account: &IoAccount,
) -> Result<BlockToken, StorageError>
where
    S: Serializer + ?Sized,
{
    let (token, gate, mut handle) = dispatch_update(ser, buf, block_id, None, account).await?;
    gate.open();
    handle.wait().await?;
    Ok(token)
}

async fn dispatch_update<S>(
    ser: &S,
    buf: Arc<BlockBuffer>,
    block_id: BlockId,
    io_callback: Option<IoCallback>,
    account: &IoAccount,
) -> Result<(BlockToken, LaunchGate, CompletionHandle), StorageError>
where
    S: Serializer + ?Sized,
{
    let block_size = ser.block_size();
    assert_eq!(
        buf.len(),
        block_size.value() as usize,
        "update of {block_id}: buffer is {} bytes, block size is {}",
        buf.len(),
        block_size.value()
    );

    let admission = account.admit().await;
    let slot = ser.io_scheduler().reserve(account.priority()).await?;
    // The write is not reported complete until the caller opens the gate,
    // which it does after running the launch callback.
    let (mut sink, gate, handle) = gated_completion_pair(io_callback);
    sink.hold_admission(admission);
    sink.hold_queue_slot(slot);

    let tokens = ser.block_writes(vec![BufWriteInfo::new(buf, block_size, block_id)], account, sink)?;
    let [token]: [BlockToken; 1] = tokens.try_into().unwrap_or_else(|issued: Vec<BlockToken>| {
        panic!("serializer issued {} tokens for one block", issued.len())
    });
    Ok((token, gate, handle))
}
