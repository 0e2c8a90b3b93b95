//! Micro-benchmarks for `RingBuffer`'s write/read/peek_all path (spec §3
//! component C1), the hot loop every socket read/write funnels through.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use kourier_net::buffer::RingBuffer;

fn write_then_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_buffer_write_then_drain");
    for &size in &[64usize, 4096, 65536] {
        let chunk = vec![0xABu8; size];
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                let mut buf = RingBuffer::new(0);
                buf.write(black_box(&chunk)).unwrap();
                let drained = buf.peek_all().len();
                buf.discard(drained);
                black_box(drained)
            });
        });
    }
    group.finish();
}

fn many_small_writes_then_one_peek(c: &mut Criterion) {
    c.bench_function("ring_buffer_many_small_writes_then_peek", |b| {
        b.iter(|| {
            let mut buf = RingBuffer::new(0);
            for _ in 0..1000 {
                buf.write(black_box(b"x")).unwrap();
            }
            black_box(buf.peek_all().len())
        });
    });
}

criterion_group!(benches, write_then_drain, many_small_writes_then_one_peek);
criterion_main!(benches);
