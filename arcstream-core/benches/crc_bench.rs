//! CRC throughput benchmarks
//!
//! Measures one-shot and chunked CRC32 updates plus the combined content
//! digest used on every streamed entry.

use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};

use arcstream_core::crc::{ContentDigest, Crc32};

mod test_data {
    /// Generate pseudo-random test data (deterministic)
    pub fn pseudo_random(size: usize) -> Vec<u8> {
        let mut state = 0x12345678u32;
        (0..size)
            .map(|_| {
                state = state.wrapping_mul(1664525).wrapping_add(1013904223);
                (state >> 24) as u8
            })
            .collect()
    }
}

const DATA_SIZES: &[(usize, &str)] = &[(1024, "1KiB"), (64 * 1024, "64KiB"), (1024 * 1024, "1MiB")];

const CHUNK_SIZE: usize = 8192;

fn bench_crc32(c: &mut Criterion) {
    let mut group = c.benchmark_group("crc32");
    for &(size, label) in DATA_SIZES {
        let data = test_data::pseudo_random(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("compute", label), &data, |b, data| {
            b.iter(|| Crc32::compute(black_box(data)));
        });
    }
    group.finish();
}

fn bench_crc32_incremental(c: &mut Criterion) {
    let mut group = c.benchmark_group("crc32_incremental");
    for &(size, label) in DATA_SIZES {
        let data = test_data::pseudo_random(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("chunked", label), &data, |b, data| {
            b.iter(|| {
                let mut crc = Crc32::new();
                for chunk in data.chunks(CHUNK_SIZE) {
                    crc.update(black_box(chunk));
                }
                crc.finalize()
            });
        });
    }
    group.finish();
}

fn bench_content_digest(c: &mut Criterion) {
    let mut group = c.benchmark_group("content_digest");
    for &(size, label) in DATA_SIZES {
        let data = test_data::pseudo_random(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("chunked", label), &data, |b, data| {
            b.iter(|| {
                let mut digest = ContentDigest::new();
                for chunk in data.chunks(CHUNK_SIZE) {
                    digest.update(black_box(chunk));
                }
                (digest.crc32(), digest.byte_sum())
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_crc32,
    bench_crc32_incremental,
    bench_content_digest
);
criterion_main!(benches);
