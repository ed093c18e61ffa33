use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use bulkstream::streaming::protocol::encode_frame;
use bulkstream::{BufferPool, RecordArena, StreamParser};

fn bench_pool_allocate(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_allocate");
    let pool = BufferPool::new();

    for size in [300usize, 4_000, 60_000, 500_000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter(|| {
                let buf = pool.allocate(black_box(size));
                pool.free(buf);
            });
        });
    }

    group.finish();
}

fn bench_encode_frame(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_frame");
    let pool = Arc::new(BufferPool::new());

    for size in [64usize, 1024, 16 * 1024, 256 * 1024].iter() {
        let payload = vec![0x5au8; *size];
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            b.iter(|| {
                let frame = encode_frame(&pool, black_box(payload)).unwrap();
                black_box(frame.len());
            });
        });
    }

    group.finish();
}

fn bench_parse_stream(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse_stream");
    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    let pool = Arc::new(BufferPool::new());

    for record_size in [128usize, 8 * 1024].iter() {
        let mut data = Vec::new();
        for _ in 0..1000 {
            let frame = encode_frame(&pool, &vec![1u8; *record_size]).unwrap();
            data.extend_from_slice(frame.as_bytes());
        }

        group.throughput(Throughput::Bytes(data.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(record_size), &data, |b, data| {
            b.iter(|| {
                rt.block_on(async {
                    let mut parser = StreamParser::new(&data[..], &pool);
                    let mut arena = RecordArena::with_capacity(*record_size);
                    let mut count = 0;
                    while let Some(record) = parser.next_record(&mut arena).await.unwrap() {
                        count += record.len();
                    }
                    black_box(count)
                })
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_pool_allocate, bench_encode_frame, bench_parse_stream);
criterion_main!(benches);
