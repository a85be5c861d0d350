use bytes::Bytes;
use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use fieldgate_buffer::{BufferConfig, BufferedMessage, MessageBuffer, OverflowPolicy};

fn buffer_add_get_remove(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffer");
    group.throughput(Throughput::Elements(1));

    group.bench_function("add", |b| {
        let buffer = MessageBuffer::open(
            BufferConfig::builder("bench")
                .max_size(1_000_000)
                .build(),
        )
        .unwrap();
        b.iter_batched(
            || BufferedMessage::new(5, Bytes::from_static(&[0u8; 64])),
            |msg| buffer.add(msg).unwrap(),
            BatchSize::SmallInput,
        );
    });

    group.bench_function("add_evicting", |b| {
        let buffer = MessageBuffer::open(
            BufferConfig::builder("bench")
                .max_size(1_000)
                .overflow(OverflowPolicy::EvictOldest)
                .build(),
        )
        .unwrap();
        b.iter_batched(
            || BufferedMessage::new(5, Bytes::from_static(&[0u8; 64])),
            |msg| buffer.add(msg).unwrap(),
            BatchSize::SmallInput,
        );
    });

    group.bench_function("get_then_remove_100", |b| {
        let buffer = MessageBuffer::open(
            BufferConfig::builder("bench")
                .max_size(100_000)
                .build(),
        )
        .unwrap();
        for _ in 0..10_000 {
            buffer
                .add(BufferedMessage::new(5, Bytes::from_static(&[0u8; 64])))
                .unwrap();
        }
        b.iter(|| {
            let batch = buffer.get(100);
            let ids: Vec<_> = batch.iter().map(|m| m.id).collect();
            buffer.remove(&ids);
            for _ in 0..ids.len() {
                buffer
                    .add(BufferedMessage::new(5, Bytes::from_static(&[0u8; 64])))
                    .unwrap();
            }
        });
    });

    group.finish();
}

criterion_group!(benches, buffer_add_get_remove);
criterion_main!(benches);
