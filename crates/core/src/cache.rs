//! Decode session over a pre-allocated key/value cache pair.

use candle_core::{DType, Device, Tensor};

use crate::error::SdpaError;
use crate::op::{SdpaOptions, SdpaWithKvCache};
use crate::validate::{SEQ_AXIS, SUPPORTED_SEQ_LEN};

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub batch_size: usize,
    pub max_seq_len: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub device: Device,
}

impl CacheConfig {
    /// `[batch, max_seq_len, num_kv_heads, head_dim]`
    pub fn cache_shape(&self) -> (usize, usize, usize, usize) {
        (
            self.batch_size,
            self.max_seq_len,
            self.num_kv_heads,
            self.head_dim,
        )
    }

    /// Bytes held by both caches: 2(K+V) * batch * max_seq_len * heads * head_dim * 4.
    pub fn memory_bytes(&self) -> usize {
        2 * self.batch_size
            * self.max_seq_len
            * self.num_kv_heads
            * self.head_dim
            * DType::F32.size_in_bytes()
    }
}

/// Owns one sequence batch's caches and the next write position.
///
/// Each [`step`](Self::step) writes at the current position and advances by
/// one only when the operator succeeds.
#[derive(Debug)]
pub struct KvCacheSession {
    key_cache: Tensor,
    value_cache: Tensor,
    position: usize,
}

impl KvCacheSession {
    /// Allocate zero-filled f32 caches.
    pub fn new(config: &CacheConfig) -> Result<Self, SdpaError> {
        let (batch, capacity, heads, head_dim) = config.cache_shape();
        for (param, extent) in [
            ("batch_size", batch),
            ("max_seq_len", capacity),
            ("num_kv_heads", heads),
            ("head_dim", head_dim),
        ] {
            if extent == 0 {
                return Err(SdpaError::invalid(param, "must be non-zero"));
            }
        }
        let shape = config.cache_shape();
        let key_cache = Tensor::zeros(shape, DType::F32, &config.device)?;
        let value_cache = Tensor::zeros(shape, DType::F32, &config.device)?;
        tracing::debug!(
            batch,
            capacity,
            heads,
            head_dim,
            bytes = config.memory_bytes(),
            "allocated kv cache"
        );
        Ok(Self {
            key_cache,
            value_cache,
            position: 0,
        })
    }

    /// Run one decode step at the current position.
    pub fn step(
        &mut self,
        op: &SdpaWithKvCache,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        options: &SdpaOptions<'_>,
    ) -> Result<Tensor, SdpaError> {
        let output = op.compute_and_update_cache(
            query,
            key,
            value,
            &mut self.key_cache,
            &mut self.value_cache,
            self.position,
            SUPPORTED_SEQ_LEN,
            options,
        )?;
        self.position += SUPPORTED_SEQ_LEN;
        Ok(output)
    }

    /// Validate a step at the current position without writing or advancing.
    pub fn shape_only(
        &self,
        op: &SdpaWithKvCache,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        options: &SdpaOptions<'_>,
    ) -> Result<Tensor, SdpaError> {
        op.shape_only(
            query,
            key,
            value,
            &self.key_cache,
            &self.value_cache,
            self.position,
            SUPPORTED_SEQ_LEN,
            options,
        )
    }

    /// Tokens resident in the cache; also the next write offset.
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn capacity(&self) -> usize {
        self.key_cache.dims()[SEQ_AXIS]
    }

    pub fn remaining(&self) -> usize {
        self.capacity().saturating_sub(self.position)
    }

    pub fn is_full(&self) -> bool {
        self.remaining() == 0
    }

    /// Zero both caches without reallocating and rewind to position 0.
    pub fn reset(&mut self) -> Result<(), SdpaError> {
        self.key_cache.slice_set(&self.key_cache.zeros_like()?, SEQ_AXIS, 0)?;
        self.value_cache
            .slice_set(&self.value_cache.zeros_like()?, SEQ_AXIS, 0)?;
        self.position = 0;
        Ok(())
    }

    pub fn key_cache(&self) -> &Tensor {
        &self.key_cache
    }

    pub fn value_cache(&self) -> &Tensor {
        &self.value_cache
    }
}
