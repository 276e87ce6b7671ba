//! Reference kernel: plain f32 loops over host memory.
//!
//! Slow, but every step of the computation is visible: one dot product per
//! (query, cache position) pair, a max-subtracted softmax, then a weighted sum
//! of value vectors. Used to check the other kernels.

use std::sync::Mutex;

use candle_core::{Result, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::ops::{effective_scale, prepare_mask, valid_len, write_kv_cache};
use super::SdpaKernel;
use crate::op::SdpaOptions;
use crate::validate::SEQ_AXIS;

#[derive(Debug)]
pub struct ReferenceSdpaKernel {
    rng: Mutex<StdRng>,
}

impl ReferenceSdpaKernel {
    pub const NAME: &'static str = "reference";

    /// `dropout_seed` fixes the dropout pattern; `None` seeds from entropy.
    pub fn new(dropout_seed: Option<u64>) -> Self {
        let rng = match dropout_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            rng: Mutex::new(rng),
        }
    }
}

impl Default for ReferenceSdpaKernel {
    fn default() -> Self {
        Self::new(None)
    }
}

impl SdpaKernel for ReferenceSdpaKernel {
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
        let (b_sz, q_len, num_heads, head_dim) = query.dims4()?;
        let (_, _, num_kv_heads, _) = key_cache.dims4()?;
        let kv_len = valid_len(start_pos, q_len)?;

        let mask = prepare_mask(options.attn_mask, kv_len)?
            .map(|m| m.flatten_all()?.to_vec1::<f32>())
            .transpose()?;
        let q = query.flatten_all()?.to_vec1::<f32>()?;

        write_kv_cache(key, value, key_cache, value_cache, start_pos)?;

        // [b, kv_len, kv_heads, d]
        let k = key_cache
            .narrow(SEQ_AXIS, 0, kv_len)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        let v = value_cache
            .narrow(SEQ_AXIS, 0, kv_len)?
            .flatten_all()?
            .to_vec1::<f32>()?;

        let scale = effective_scale(options.scale, head_dim) as f32;
        let group = num_heads / num_kv_heads;
        let drop_p = options.dropout_p as f32;
        let mut rng = if drop_p > 0.0 {
            let guard = self
                .rng
                .lock()
                .map_err(|_| candle_core::Error::Msg("dropout rng mutex poisoned".to_string()))?;
            Some(guard)
        } else {
            None
        };

        let mut output = vec![0f32; q.len()];
        let mut row = vec![0f32; kv_len];
        for b in 0..b_sz {
            for s in 0..q_len {
                for h in 0..num_heads {
                    let kv_h = h / group;
                    let q_off = ((b * q_len + s) * num_heads + h) * head_dim;
                    let q_vec = &q[q_off..q_off + head_dim];

                    let mut max_val = f32::NEG_INFINITY;
                    for (j, score) in row.iter_mut().enumerate() {
                        let k_off = ((b * kv_len + j) * num_kv_heads + kv_h) * head_dim;
                        let k_vec = &k[k_off..k_off + head_dim];
                        let mut dot = q_vec.iter().zip(k_vec).map(|(a, b)| a * b).sum::<f32>();
                        dot *= scale;
                        if options.is_causal && j > start_pos + s {
                            dot = f32::NEG_INFINITY;
                        }
                        if let Some(mask) = &mask {
                            dot += mask[s * kv_len + j];
                        }
                        *score = dot;
                        if dot > max_val {
                            max_val = dot;
                        }
                    }
                    // Fully masked row: leave the output at zero.
                    if max_val == f32::NEG_INFINITY {
                        continue;
                    }

                    let mut denom = 0f32;
                    for score in row.iter_mut() {
                        *score = (*score - max_val).exp();
                        denom += *score;
                    }

                    let out = &mut output[q_off..q_off + head_dim];
                    for (j, &score) in row.iter().enumerate() {
                        let mut weight = score / denom;
                        if let Some(rng) = rng.as_mut() {
                            weight = if rng.gen::<f32>() < drop_p {
                                0.0
                            } else {
                                weight / (1.0 - drop_p)
                            };
                        }
                        if weight == 0.0 {
                            continue;
                        }
                        let v_off = ((b * kv_len + j) * num_kv_heads + kv_h) * head_dim;
                        for (o, x) in out.iter_mut().zip(&v[v_off..v_off + head_dim]) {
                            *o += weight * x;
                        }
                    }
                }
            }
        }

        Tensor::from_vec(output, (b_sz, q_len, num_heads, head_dim), query.device())
    }
}
