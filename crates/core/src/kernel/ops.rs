//! Common operations shared across kernels.

use candle_core::{DType, Device, Result, Tensor};

use crate::validate::SEQ_AXIS;

/// Default softmax scale, `1 / sqrt(head_dim)`, unless overridden.
pub fn effective_scale(scale: Option<f64>, head_dim: usize) -> f64 {
    scale.unwrap_or_else(|| 1.0 / (head_dim as f64).sqrt())
}

/// End of the valid cache prefix, `start_pos + seq_len`.
///
/// Offsets are unchecked when bounds checking is relaxed, so overflow is a
/// backend error here rather than a panic or a wrapped index.
pub fn valid_len(start_pos: usize, seq_len: usize) -> Result<usize> {
    match start_pos.checked_add(seq_len) {
        Some(end) => Ok(end),
        None => candle_core::bail!(
            "cache offset overflow: start_pos {start_pos} + seq_len {seq_len}"
        ),
    }
}

/// Write one step's key/value into the caches at `start_pos`, in place.
///
/// `key`/`value`: `[batch, seq_len, kv_heads, head_dim]`
/// `key_cache`/`value_cache`: `[batch, capacity, kv_heads, head_dim]`
///
/// The caches keep their storage; every clone of them observes the write.
/// An offset past the end is rejected before either cache is touched.
pub fn write_kv_cache(
    key: &Tensor,
    value: &Tensor,
    key_cache: &mut Tensor,
    value_cache: &mut Tensor,
    start_pos: usize,
) -> Result<()> {
    let seq_len = key.dim(SEQ_AXIS)?;
    let capacity = key_cache.dim(SEQ_AXIS)?;
    if valid_len(start_pos, seq_len)? > capacity {
        candle_core::bail!(
            "cache write out of range: start_pos {start_pos} + seq_len {seq_len} > capacity {capacity}"
        );
    }
    key_cache.slice_set(&key.contiguous()?, SEQ_AXIS, start_pos)?;
    value_cache.slice_set(&value.contiguous()?, SEQ_AXIS, start_pos)?;
    Ok(())
}

/// Valid cache prefix `[0, valid_len)` in head-major layout
/// `[batch, kv_heads, valid_len, head_dim]`.
pub fn cache_prefix(cache: &Tensor, valid_len: usize) -> Result<Tensor> {
    cache
        .narrow(SEQ_AXIS, 0, valid_len)?
        .transpose(1, 2)?
        .contiguous()
}

/// Slice an additive `[seq_len, M]` mask down to the valid prefix and
/// promote it to f32.
///
/// Returns `[seq_len, valid_len]`.
pub fn prepare_mask(attn_mask: Option<&Tensor>, valid_len: usize) -> Result<Option<Tensor>> {
    attn_mask
        .map(|mask| mask.narrow(1, 0, valid_len)?.to_dtype(DType::F32))
        .transpose()
}

/// Repeat KV heads for Grouped Query Attention.
///
/// When using GQA (Grouped Query Attention), the number of KV heads is less than
/// the number of query heads. This function repeats the KV heads so they can be
/// used with the full number of query heads.
///
/// # Arguments
/// * `x` - Input tensor `[batch, num_kv_heads, seq_len, head_dim]`
/// * `num_kv_groups` - Number of times to repeat each KV head (num_heads / num_kv_heads)
///
/// # Returns
/// Tensor with shape `[batch, num_heads, seq_len, head_dim]`
pub fn repeat_kv(x: Tensor, num_kv_groups: usize) -> Result<Tensor> {
    if num_kv_groups == 1 {
        return Ok(x);
    }
    let (b, num_kv_heads, s, d) = x.dims4()?;
    let num_heads = num_kv_heads * num_kv_groups;
    x.unsqueeze(2)?
        .expand((b, num_kv_heads, num_kv_groups, s, d))?
        .reshape((b, num_heads, s, d))
}

/// Causal mask for `seq_len` queries written at `seqlen_offset`.
/// Returns shape [1, 1, seq_len, seq_len + seqlen_offset].
///
/// Query row `i` sits at absolute position `seqlen_offset + i` and may see
/// every cache position up to and including its own.
pub fn causal_mask(
    seq_len: usize,
    seqlen_offset: usize,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    let total_len = seq_len + seqlen_offset;
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| {
            (0..total_len).map(move |j| {
                if j > i + seqlen_offset {
                    f32::NEG_INFINITY
                } else {
                    0.0
                }
            })
        })
        .collect();
    let mask = Tensor::from_vec(mask, (1, 1, seq_len, total_len), device)?;
    mask.to_dtype(dtype)
}
