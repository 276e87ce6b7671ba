//! Shared test utilities for kvsdpa-core.
//!
//! Deterministic tensor builders for decode steps and caches, plus a couple
//! of comparison helpers. All tensors live on the CPU.

use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Rank-4 f32 tensor filled with uniform values in `[-1, 1)` from `seed`.
pub fn seeded_tensor(shape: (usize, usize, usize, usize), seed: u64) -> Tensor {
    let (a, b, c, d) = shape;
    let mut rng = StdRng::seed_from_u64(seed);
    let data: Vec<f32> = (0..a * b * c * d)
        .map(|_| rng.gen_range(-1.0f32..1.0))
        .collect();
    Tensor::from_vec(data, shape, &Device::Cpu).expect("seeded tensor")
}

/// Query, key and value for one decode step.
///
/// Query is `[batch, 1, num_heads, head_dim]`; key and value are
/// `[batch, 1, num_kv_heads, head_dim]`.
pub fn decode_step(
    batch: usize,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    seed: u64,
) -> (Tensor, Tensor, Tensor) {
    let q = seeded_tensor((batch, 1, num_heads, head_dim), seed);
    let k = seeded_tensor((batch, 1, num_kv_heads, head_dim), seed.wrapping_add(1));
    let v = seeded_tensor((batch, 1, num_kv_heads, head_dim), seed.wrapping_add(2));
    (q, k, v)
}

/// Zero-filled key/value caches `[batch, capacity, num_kv_heads, head_dim]`.
pub fn zero_caches(
    batch: usize,
    capacity: usize,
    num_kv_heads: usize,
    head_dim: usize,
) -> (Tensor, Tensor) {
    let shape = (batch, capacity, num_kv_heads, head_dim);
    let k = Tensor::zeros(shape, DType::F32, &Device::Cpu).expect("key cache");
    let v = Tensor::zeros(shape, DType::F32, &Device::Cpu).expect("value cache");
    (k, v)
}

/// Flatten any f32 tensor into a host vector.
pub fn to_vec(t: &Tensor) -> Vec<f32> {
    t.flatten_all()
        .and_then(|t| t.to_vec1::<f32>())
        .expect("flatten f32 tensor")
}

/// Largest absolute element-wise difference between two same-shaped tensors.
pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    assert_eq!(a.dims(), b.dims(), "shape mismatch");
    to_vec(a)
        .iter()
        .zip(to_vec(b).iter())
        .map(|(x, y)| (x - y).abs())
        .fold(0.0f32, f32::max)
}
