//! Naive attention kernel using standard matrix operations.
//!
//! This is the default kernel and works on any candle device. It computes
//! standard scaled dot-product attention over the cache prefix without fusion.

use candle_core::{DType, Result, Tensor};
use candle_nn::ops::{dropout, softmax_last_dim};

use super::ops::{
    cache_prefix, causal_mask, effective_scale, prepare_mask, repeat_kv, valid_len,
    write_kv_cache,
};
use super::SdpaKernel;
use crate::op::SdpaOptions;

/// Naive kernel using candle matmul / softmax.
#[derive(Debug, Clone, Copy)]
pub struct NaiveSdpaKernel;

impl NaiveSdpaKernel {
    pub const NAME: &'static str = "naive";

    pub fn new() -> Self {
        Self
    }
}

impl Default for NaiveSdpaKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl SdpaKernel for NaiveSdpaKernel {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        key_cache: &mut Tensor,
        value_cache: &mut Tensor,
        start_pos: usize,
        options: &SdpaOptions<'_>,
    ) -> Result<Tensor> {
        let (_b_sz, q_len, num_heads, head_dim) = query.dims4()?;
        let (_, _, num_kv_heads, _) = key_cache.dims4()?;
        let kv_len = valid_len(start_pos, q_len)?;

        // Anything that can fail on shapes runs before the cache is touched.
        let mask = prepare_mask(options.attn_mask, kv_len)?;
        let causal = if options.is_causal {
            Some(causal_mask(q_len, start_pos, DType::F32, query.device())?)
        } else {
            None
        };

        write_kv_cache(key, value, key_cache, value_cache, start_pos)?;

        // [b, kv_heads, kv_len, d], repeated up to the query heads for GQA
        let num_kv_groups = num_heads / num_kv_heads;
        let k_full = repeat_kv(cache_prefix(key_cache, kv_len)?, num_kv_groups)?;
        let v_full = repeat_kv(cache_prefix(value_cache, kv_len)?, num_kv_groups)?;

        // [b, q_len, heads, d] → [b, heads, q_len, d]
        let q = query.transpose(1, 2)?.contiguous()?;

        let scale = effective_scale(options.scale, head_dim);
        let mut attn_weights = (q.matmul(&k_full.transpose(2, 3)?)? * scale)?;
        if let Some(causal) = &causal {
            attn_weights = attn_weights.broadcast_add(causal)?;
        }
        if let Some(mask) = &mask {
            attn_weights = attn_weights.broadcast_add(mask)?;
        }
        let attn_weights = softmax_last_dim(&attn_weights)?;
        let attn_weights = if options.dropout_p > 0.0 {
            dropout(&attn_weights, options.dropout_p as f32)?
        } else {
            attn_weights
        };
        let attn_output = attn_weights.matmul(&v_full)?;

        // [b, heads, q_len, d] → [b, q_len, heads, d]
        attn_output.transpose(1, 2)?.contiguous()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{decode_step, to_vec, zero_caches};
    use candle_core::Device;

    fn vec4(data: &[f32], shape: (usize, usize, usize, usize)) -> Tensor {
        Tensor::from_vec(data.to_vec(), shape, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_naive_kernel_name() {
        assert_eq!(NaiveSdpaKernel::new().name(), "naive");
    }

    #[test]
    fn test_single_position_returns_its_value() {
        let (mut kc, mut vc) = zero_caches(1, 4, 1, 2);
        let q = vec4(&[1.0, 0.0], (1, 1, 1, 2));
        let k = vec4(&[1.0, 0.0], (1, 1, 1, 2));
        let v = vec4(&[5.0, 7.0], (1, 1, 1, 2));

        let out = NaiveSdpaKernel::new()
            .forward(&q, &k, &v, &mut kc, &mut vc, 0, &SdpaOptions::default())
            .unwrap();

        assert_eq!(out.dims(), &[1, 1, 1, 2]);
        let out = to_vec(&out);
        assert!((out[0] - 5.0).abs() < 1e-6 && (out[1] - 7.0).abs() < 1e-6);
    }

    #[test]
    fn test_mask_suppresses_second_position() {
        let kernel = NaiveSdpaKernel::new();
        let (mut kc, mut vc) = zero_caches(1, 4, 1, 2);
        let q = vec4(&[1.0, 1.0], (1, 1, 1, 2));

        kernel
            .forward(
                &q,
                &vec4(&[1.0, 0.0], (1, 1, 1, 2)),
                &vec4(&[1.0, 2.0], (1, 1, 1, 2)),
                &mut kc,
                &mut vc,
                0,
                &SdpaOptions::default(),
            )
            .unwrap();

        let mask = Tensor::new(&[[0f32, -1e9]], &Device::Cpu).unwrap();
        let out = kernel
            .forward(
                &q,
                &vec4(&[0.0, 1.0], (1, 1, 1, 2)),
                &vec4(&[3.0, 4.0], (1, 1, 1, 2)),
                &mut kc,
                &mut vc,
                1,
                &SdpaOptions::default().with_mask(&mask),
            )
            .unwrap();

        let out = to_vec(&out);
        assert!((out[0] - 1.0).abs() < 1e-5, "got {out:?}");
        assert!((out[1] - 2.0).abs() < 1e-5, "got {out:?}");
    }

    #[test]
    fn test_equal_scores_average_values() {
        let kernel = NaiveSdpaKernel::new();
        let (mut kc, mut vc) = zero_caches(1, 2, 1, 2);
        let q = vec4(&[1.0, 1.0], (1, 1, 1, 2));
        let k = vec4(&[0.5, 0.5], (1, 1, 1, 2));
        let opts = SdpaOptions::default();

        kernel
            .forward(&q, &k, &vec4(&[2.0, 0.0], (1, 1, 1, 2)), &mut kc, &mut vc, 0, &opts)
            .unwrap();
        let out = kernel
            .forward(&q, &k, &vec4(&[0.0, 4.0], (1, 1, 1, 2)), &mut kc, &mut vc, 1, &opts)
            .unwrap();

        let out = to_vec(&out);
        assert!((out[0] - 1.0).abs() < 1e-6 && (out[1] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_custom_scale_sharpens_distribution() {
        let kernel = NaiveSdpaKernel::new();
        let q = vec4(&[1.0, 0.0], (1, 1, 1, 2));
        let run = |scale: Option<f64>| {
            let (mut kc, mut vc) = zero_caches(1, 2, 1, 2);
            let opts = SdpaOptions {
                scale,
                ..SdpaOptions::default()
            };
            kernel
                .forward(
                    &q,
                    &vec4(&[1.0, 0.0], (1, 1, 1, 2)),
                    &vec4(&[1.0, 0.0], (1, 1, 1, 2)),
                    &mut kc,
                    &mut vc,
                    0,
                    &opts,
                )
                .unwrap();
            let out = kernel
                .forward(
                    &q,
                    &vec4(&[0.0, 0.0], (1, 1, 1, 2)),
                    &vec4(&[0.0, 1.0], (1, 1, 1, 2)),
                    &mut kc,
                    &mut vc,
                    1,
                    &opts,
                )
                .unwrap();
            to_vec(&out)[0]
        };

        // Weight on position 0 is sigmoid(scale): 1/sqrt(2) by default.
        let default_weight = run(None);
        let expected = 1.0 / (1.0 + (-(1.0f32 / 2f32.sqrt())).exp());
        assert!((default_weight - expected).abs() < 1e-5);
        assert!(run(Some(10.0)) > 0.99);
    }

    #[test]
    fn test_zero_scale_gives_uniform_weights() {
        let kernel = NaiveSdpaKernel::new();
        let (mut kc, mut vc) = zero_caches(1, 2, 1, 2);
        let q = vec4(&[3.0, -2.0], (1, 1, 1, 2));
        let opts = SdpaOptions::default().with_scale(Some(0.0));

        kernel
            .forward(
                &q,
                &vec4(&[5.0, 1.0], (1, 1, 1, 2)),
                &vec4(&[2.0, 0.0], (1, 1, 1, 2)),
                &mut kc,
                &mut vc,
                0,
                &opts,
            )
            .unwrap();
        let out = kernel
            .forward(
                &q,
                &vec4(&[-4.0, 7.0], (1, 1, 1, 2)),
                &vec4(&[0.0, 4.0], (1, 1, 1, 2)),
                &mut kc,
                &mut vc,
                1,
                &opts,
            )
            .unwrap();

        let out = to_vec(&out);
        assert!((out[0] - 1.0).abs() < 1e-6 && (out[1] - 2.0).abs() < 1e-6, "got {out:?}");
    }

    #[test]
    fn test_dropout_zeroes_or_rescales_each_head() {
        let kernel = NaiveSdpaKernel::new();
        let opts = SdpaOptions::default().with_dropout(0.5);
        let q = vec4(&[1.0, 0.0, 0.0, 1.0], (1, 1, 2, 2));
        let v = vec4(&[1.0, 3.0, -2.0, 5.0], (1, 1, 2, 2));
        let v_data = to_vec(&v);

        for _ in 0..16 {
            let (mut kc, mut vc) = zero_caches(1, 1, 2, 2);
            let out = kernel
                .forward(&q, &q, &v, &mut kc, &mut vc, 0, &opts)
                .unwrap();
            assert_eq!(out.dims(), q.dims());

            // One resident position: each head keeps weight 1 / (1 - p) or drops to 0.
            let out = to_vec(&out);
            for h in 0..2 {
                let got = &out[h * 2..h * 2 + 2];
                let want = &v_data[h * 2..h * 2 + 2];
                let dropped = got.iter().all(|x| *x == 0.0);
                let kept = got
                    .iter()
                    .zip(want)
                    .all(|(g, w)| (g - w * 2.0).abs() < 1e-5);
                assert!(dropped || kept, "head {h}: unexpected output {got:?}");
            }
        }
    }

    #[test]
    fn test_gqa_shares_cache_heads() {
        let kernel = NaiveSdpaKernel::new();
        let (q, k, v) = decode_step(2, 4, 2, 8, 11);
        let (mut kc, mut vc) = zero_caches(2, 3, 2, 8);

        let out = kernel
            .forward(&q, &k, &v, &mut kc, &mut vc, 0, &SdpaOptions::default())
            .unwrap();

        // With one cache position every query head returns its group's value.
        assert_eq!(out.dims(), &[2, 1, 4, 8]);
        let out = to_vec(&out);
        let v = to_vec(&v);
        for b in 0..2 {
            for h in 0..4 {
                let kv_h = h / 2;
                for d in 0..8 {
                    let got = out[(b * 4 + h) * 8 + d];
                    let want = v[(b * 2 + kv_h) * 8 + d];
                    assert!((got - want).abs() < 1e-6);
                }
            }
        }
    }

    #[test]
    fn test_causal_is_noop_for_single_step() {
        let kernel = NaiveSdpaKernel::new();
        let (mut kc_a, mut vc_a) = zero_caches(1, 4, 2, 4);
        let (mut kc_b, mut vc_b) = zero_caches(1, 4, 2, 4);
        let causal = SdpaOptions::default().causal(true);

        let mut last = None;
        for pos in 0..3 {
            let (q, k, v) = decode_step(1, 2, 2, 4, 100 + pos as u64);
            let plain = kernel
                .forward(&q, &k, &v, &mut kc_a, &mut vc_a, pos, &SdpaOptions::default())
                .unwrap();
            let masked = kernel
                .forward(&q, &k, &v, &mut kc_b, &mut vc_b, pos, &causal)
                .unwrap();
            last = Some((plain, masked));
        }
        let (plain, masked) = last.unwrap();
        assert!(crate::testing::max_abs_diff(&plain, &masked) < 1e-7);
    }

    #[test]
    fn test_short_mask_fails_before_write() {
        let kernel = NaiveSdpaKernel::new();
        let (q, k, v) = decode_step(1, 1, 1, 2, 5);
        let (mut kc, mut vc) = zero_caches(1, 4, 1, 2);
        let mask = Tensor::zeros((1, 1), DType::F32, &Device::Cpu).unwrap();

        let result = kernel.forward(
            &q,
            &k,
            &v,
            &mut kc,
            &mut vc,
            2,
            &SdpaOptions::default().with_mask(&mask),
        );

        assert!(result.is_err());
        assert!(to_vec(&kc).iter().all(|x| *x == 0.0));
    }
}
