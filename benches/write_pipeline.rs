use std::sync::Arc;
use std::time::Instant;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use tokio::runtime::Runtime;

use kyroblock::storage::persistent::{open_serializer, PersistentConfig};
use kyroblock::storage::{InMemorySerializer, SerializerConfig};
use kyroblock::{commit_batch, BlockId, IoPriority, Recency, Serializer, SerializerWrite};

const BATCH: u64 = 32;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

fn batch<S: Serializer>(ser: &S, round: u64) -> Vec<SerializerWrite> {
    (0..BATCH)
        .map(|i| {
            let mut buf = ser.malloc();
            buf.payload_mut()[0] = i as u8;
            SerializerWrite::make_update(BlockId::new(i), Recency::new(round + 1), Arc::new(buf))
        })
        .collect()
}

fn bench_in_memory_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("commit_batch");
    group.throughput(Throughput::Elements(BATCH));

    group.bench_function("in_memory_32x4k", |b| {
        let rt = runtime();
        b.iter_custom(|iters| {
            // Fresh serializer per sample so extents don't accumulate between samples.
            let ser = InMemorySerializer::new(SerializerConfig::default()).unwrap();
            let account = ser.make_io_account(IoPriority::DEFAULT);

            let start = Instant::now();
            rt.block_on(async {
                for round in 0..iters {
                    commit_batch(&ser, batch(&ser, round), &account).await.unwrap();
                }
            });
            start.elapsed()
        });
    });

    group.bench_function("persistent_32x4k_nosync", |b| {
        let rt = runtime();
        b.iter_custom(|iters| {
            let dir = tempfile::tempdir().unwrap();
            let ser = open_serializer(
                dir.path(),
                Some(PersistentConfig {
                    sync_on_write: false,
                    ..PersistentConfig::default()
                }),
            )
            .unwrap();
            let account = ser.make_io_account(IoPriority::DEFAULT);

            let start = Instant::now();
            rt.block_on(async {
                for round in 0..iters {
                    commit_batch(&ser, batch(&ser, round), &account).await.unwrap();
                }
            });
            start.elapsed()
        });
    });

    group.finish();
}

fn bench_mixed_batch(c: &mut Criterion) {
    c.bench_function("commit_batch/mixed_update_delete_touch", |b| {
        let rt = runtime();
        b.iter_custom(|iters| {
            let ser = InMemorySerializer::new(SerializerConfig::default()).unwrap();
            let account = ser.make_io_account(IoPriority::DEFAULT);

            let start = Instant::now();
            rt.block_on(async {
                for round in 0..iters {
                    let mut buf = ser.malloc();
                    buf.payload_mut()[0] = 0x58;
                    let writes = vec![
                        SerializerWrite::make_update(BlockId::new(1), Recency::new(round + 1), Arc::new(buf)),
                        SerializerWrite::make_delete(BlockId::new(2)),
                        SerializerWrite::make_touch(BlockId::new(3), Recency::new(round + 1)),
                    ];
                    commit_batch(&ser, writes, &account).await.unwrap();
                }
            });
            start.elapsed()
        });
    });
}

criterion_group!(write_pipeline, bench_in_memory_commit, bench_mixed_batch);
criterion_main!(write_pipeline);
