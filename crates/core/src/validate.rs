//! Precondition checks for the decode-step attention operator.
//!
//! Everything here is pure: no tensor is written, nothing is cached between
//! calls. The operator runs these checks before it touches the KV cache, so a
//! failure always leaves the caches exactly as the caller handed them in.
//!
//! Checks run fail-fast, in a fixed order:
//!
//! 1. `query`, `key`, `value` have rank 4
//! 2. `query`, `key`, `value` are f32
//! 3. `key_cache`, `value_cache` have rank 4
//! 4. `key_cache`, `value_cache` are f32
//! 5. `key_cache` and `value_cache` share a shape
//! 6. `seq_len == 1`
//! 7. `attn_mask`, when present, has rank 2 and is f32 or f16
//!
//! followed by the cross-tensor consistency checks (matching batch, heads and
//! head_dim between the step tensors and the cache), the scalar modifiers and
//! device placement. Capacity bounds live in [`validate_bounds`].

use candle_core::{DType, Tensor};

use crate::error::SdpaError;

/// Axis of `[batch, seq, heads, head_dim]` tensors that indexes positions.
pub const SEQ_AXIS: usize = 1;

/// Only single-token decode steps are supported.
pub const SUPPORTED_SEQ_LEN: usize = 1;

/// Validate operator inputs.
///
/// `start_pos` and `is_causal` impose no structural constraint; they are part
/// of the signature so callers can pass the operator's argument list through
/// unchanged. Capacity checks against `start_pos` are in [`validate_bounds`].
#[allow(clippy::too_many_arguments)]
pub fn validate_params(
    query: &Tensor,
    key: &Tensor,
    value: &Tensor,
    key_cache: &Tensor,
    value_cache: &Tensor,
    start_pos: usize,
    seq_len: usize,
    attn_mask: Option<&Tensor>,
    dropout_p: f64,
    is_causal: bool,
    scale: Option<f64>,
) -> Result<(), SdpaError> {
    let _ = (start_pos, is_causal);

    for (param, t) in [("query", query), ("key", key), ("value", value)] {
        check_rank(param, t, 4)?;
    }
    for (param, t) in [("query", query), ("key", key), ("value", value)] {
        check_f32(param, t)?;
    }
    for (param, t) in [("key_cache", key_cache), ("value_cache", value_cache)] {
        check_rank(param, t, 4)?;
    }
    for (param, t) in [("key_cache", key_cache), ("value_cache", value_cache)] {
        check_f32(param, t)?;
    }

    if key_cache.dims() != value_cache.dims() {
        return Err(SdpaError::invalid(
            "value_cache",
            format!(
                "key_cache and value_cache must have the same shape but got {:?} and {:?}",
                key_cache.dims(),
                value_cache.dims()
            ),
        ));
    }

    if seq_len != SUPPORTED_SEQ_LEN {
        return Err(SdpaError::invalid(
            "seq_len",
            format!("only seq_len = {SUPPORTED_SEQ_LEN} is supported but got {seq_len}"),
        ));
    }

    if let Some(mask) = attn_mask {
        check_rank("attn_mask", mask, 2)?;
        if !matches!(mask.dtype(), DType::F32 | DType::F16) {
            return Err(SdpaError::invalid(
                "attn_mask",
                format!("expected f32 or f16 but got {}", mask.dtype().as_str()),
            ));
        }
    }

    check_consistency(query, key, value, key_cache, value_cache, seq_len, attn_mask)?;
    check_modifiers(dropout_p, scale)?;
    check_placement(query, key, value, key_cache, value_cache, attn_mask)?;

    Ok(())
}

/// Check that a write at `start_pos` fits in the cache and that the mask
/// covers the whole valid prefix `[0, start_pos + seq_len)`.
///
/// Assumes [`validate_params`] already passed.
pub fn validate_bounds(
    key_cache: &Tensor,
    start_pos: usize,
    seq_len: usize,
    attn_mask: Option<&Tensor>,
) -> Result<(), SdpaError> {
    let capacity = key_cache.dim(SEQ_AXIS)?;
    if start_pos >= capacity {
        return Err(SdpaError::invalid(
            "start_pos",
            format!("start position {start_pos} must be less than cache capacity {capacity}"),
        ));
    }
    let end = start_pos.saturating_add(seq_len);
    if end > capacity {
        return Err(SdpaError::invalid(
            "seq_len",
            format!("start_pos + seq_len = {end} must not exceed cache capacity {capacity}"),
        ));
    }
    if let Some(mask) = attn_mask {
        let columns = mask.dim(1)?;
        if columns < end {
            return Err(SdpaError::invalid(
                "attn_mask",
                format!(
                    "expected at least {end} columns to cover the valid cache prefix but got {columns}"
                ),
            ));
        }
    }
    Ok(())
}

fn check_rank(param: &'static str, t: &Tensor, expected: usize) -> Result<(), SdpaError> {
    if t.rank() != expected {
        return Err(SdpaError::invalid(
            param,
            format!(
                "expected {expected} dimensions but got {} dimensions (shape {:?})",
                t.rank(),
                t.dims()
            ),
        ));
    }
    Ok(())
}

fn check_f32(param: &'static str, t: &Tensor) -> Result<(), SdpaError> {
    if t.dtype() != DType::F32 {
        return Err(SdpaError::invalid(
            param,
            format!("expected f32 but got {}", t.dtype().as_str()),
        ));
    }
    Ok(())
}

fn check_consistency(
    query: &Tensor,
    key: &Tensor,
    value: &Tensor,
    key_cache: &Tensor,
    value_cache: &Tensor,
    seq_len: usize,
    attn_mask: Option<&Tensor>,
) -> Result<(), SdpaError> {
    let (cache_batch, _capacity, cache_heads, head_dim) = key_cache.dims4()?;
    if cache_heads == 0 || head_dim == 0 {
        return Err(SdpaError::invalid(
            "key_cache",
            format!(
                "heads and head_dim must be non-zero but got shape {:?}",
                key_cache.dims()
            ),
        ));
    }
    for (param, cache) in [("key_cache", key_cache), ("value_cache", value_cache)] {
        if !cache.is_contiguous() {
            return Err(SdpaError::invalid(
                param,
                "cache must be contiguous to be updated in place",
            ));
        }
    }

    if key.dims() != value.dims() {
        return Err(SdpaError::invalid(
            "value",
            format!(
                "key and value must have the same shape but got {:?} and {:?}",
                key.dims(),
                value.dims()
            ),
        ));
    }

    let (kb, ks, kh, kd) = key.dims4()?;
    if ks != seq_len {
        return Err(SdpaError::invalid(
            "key",
            format!("expected sequence extent {seq_len} but got {ks}"),
        ));
    }
    if (kb, kh, kd) != (cache_batch, cache_heads, head_dim) {
        return Err(SdpaError::invalid(
            "key",
            format!(
                "expected [{cache_batch}, {seq_len}, {cache_heads}, {head_dim}] to match the cache but got {:?}",
                key.dims()
            ),
        ));
    }

    let (qb, qs, qh, qd) = query.dims4()?;
    if qs != seq_len {
        return Err(SdpaError::invalid(
            "query",
            format!("expected sequence extent {seq_len} but got {qs}"),
        ));
    }
    if qb != cache_batch || qd != head_dim {
        return Err(SdpaError::invalid(
            "query",
            format!(
                "expected batch {cache_batch} and head_dim {head_dim} to match the cache but got {:?}",
                query.dims()
            ),
        ));
    }
    if qh == 0 || qh % cache_heads != 0 {
        return Err(SdpaError::invalid(
            "query",
            format!("expected a non-zero multiple of {cache_heads} heads but got {qh}"),
        ));
    }

    if let Some(mask) = attn_mask {
        let (rows, _columns) = mask.dims2()?;
        if rows != seq_len {
            return Err(SdpaError::invalid(
                "attn_mask",
                format!("expected {seq_len} rows (one per query position) but got {rows}"),
            ));
        }
    }

    Ok(())
}

fn check_modifiers(dropout_p: f64, scale: Option<f64>) -> Result<(), SdpaError> {
    if !(0.0..1.0).contains(&dropout_p) {
        return Err(SdpaError::invalid(
            "dropout_p",
            format!("dropout probability must be in [0, 1) but got {dropout_p}"),
        ));
    }
    if let Some(scale) = scale {
        if !scale.is_finite() {
            return Err(SdpaError::invalid(
                "scale",
                format!("scale must be finite but got {scale}"),
            ));
        }
    }
    Ok(())
}

fn check_placement(
    query: &Tensor,
    key: &Tensor,
    value: &Tensor,
    key_cache: &Tensor,
    value_cache: &Tensor,
    attn_mask: Option<&Tensor>,
) -> Result<(), SdpaError> {
    let device = query.device();
    let others = [
        ("key", Some(key)),
        ("value", Some(value)),
        ("key_cache", Some(key_cache)),
        ("value_cache", Some(value_cache)),
        ("attn_mask", attn_mask),
    ];
    for (param, t) in others {
        if let Some(t) = t {
            if !device.same_device(t.device()) {
                return Err(SdpaError::invalid(
                    param,
                    format!(
                        "expected device {:?} (same as query) but got {:?}",
                        device.location(),
                        t.device().location()
                    ),
                ));
            }
        }
    }
    Ok(())
}
