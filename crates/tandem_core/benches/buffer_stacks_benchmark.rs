//! # Buffer Stack Benchmark
//!
//! Steady-state cost of one read/consume rotation once storage is warm.
//!
//! Run with: `cargo bench --package tandem_core`

// Benchmarks don't need docs
#![allow(missing_docs)]

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tandem_core::{BufferStacks, Drain};

fn bench_rotation(c: &mut Criterion) {
    let stacks = BufferStacks::new(10_000);
    let payload = vec![7u8; 4096];

    c.bench_function("rotate_one_4k_buffer", |b| {
        b.iter(|| {
            let mut buffer = stacks.take_storage();
            buffer.extend_from_slice(&payload);
            stacks.push_received(buffer);
            let batch = stacks.begin_consume(Drain::One);
            black_box(batch.len());
            stacks.finish_consume(batch);
        });
    });
}

fn bench_drain_all(c: &mut Criterion) {
    let stacks = BufferStacks::new(1_024);

    c.bench_function("drain_all_16_buffers", |b| {
        b.iter(|| {
            for tag in 0..16u8 {
                let mut buffer = stacks.take_storage();
                buffer.push(tag);
                stacks.push_received(buffer);
            }
            let batch = stacks.begin_consume(Drain::All);
            black_box(batch.len());
            stacks.finish_consume(batch);
        });
    });
}

criterion_group!(benches, bench_rotation, bench_drain_all);
criterion_main!(benches);
