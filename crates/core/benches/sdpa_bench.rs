//! Criterion benchmarks for the decode-step operator.
//!
//! One step at the end of a nearly full cache, for each kernel, plus the
//! validation-only path. All on CPU.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use kvsdpa_core::kernel::{select_kernel, AVAILABLE_KERNELS};
use kvsdpa_core::testing::{decode_step, seeded_tensor};
use kvsdpa_core::{SdpaOptions, SdpaWithKvCache};

const BATCH: usize = 1;
const NUM_HEADS: usize = 8;
const NUM_KV_HEADS: usize = 2;
const HEAD_DIM: usize = 64;

// ---------------------------------------------------------------------------
// Decode step
// ---------------------------------------------------------------------------

fn bench_decode_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_step");
    let (q, k, v) = decode_step(BATCH, NUM_HEADS, NUM_KV_HEADS, HEAD_DIM, 0);

    for kernel_name in AVAILABLE_KERNELS {
        for &capacity in &[128, 512, 2048] {
            let op = SdpaWithKvCache::new(select_kernel(kernel_name, None).expect("kernel"));
            let shape = (BATCH, capacity, NUM_KV_HEADS, HEAD_DIM);
            let mut key_cache = seeded_tensor(shape, 1);
            let mut value_cache = seeded_tensor(shape, 2);
            let start_pos = capacity - 1;

            group.bench_with_input(
                BenchmarkId::new(*kernel_name, capacity),
                &capacity,
                |b, _| {
                    b.iter(|| {
                        op.compute_and_update_cache(
                            black_box(&q),
                            &k,
                            &v,
                            &mut key_cache,
                            &mut value_cache,
                            start_pos,
                            1,
                            &SdpaOptions::default(),
                        )
                        .expect("decode step failed")
                    });
                },
            );
        }
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Shape-only path
// ---------------------------------------------------------------------------

fn bench_shape_only(c: &mut Criterion) {
    let (q, k, v) = decode_step(BATCH, NUM_HEADS, NUM_KV_HEADS, HEAD_DIM, 0);
    let shape = (BATCH, 2048, NUM_KV_HEADS, HEAD_DIM);
    let key_cache = seeded_tensor(shape, 1);
    let value_cache = seeded_tensor(shape, 2);
    let op = SdpaWithKvCache::default();

    c.bench_function("shape_only", |b| {
        b.iter(|| {
            op.shape_only(
                black_box(&q),
                &k,
                &v,
                &key_cache,
                &value_cache,
                2047,
                1,
                &SdpaOptions::default(),
            )
            .expect("shape-only step failed")
        });
    });
}

criterion_group!(benches, bench_decode_step, bench_shape_only);
criterion_main!(benches);
