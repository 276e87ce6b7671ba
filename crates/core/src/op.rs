//! The decode-step operator: validate, write the cache, attend.
//!
//! [`SdpaWithKvCache`] holds the kernel provider chosen at startup and the
//! bounds policy. Each call validates first and only then hands the inputs to
//! the kernel, so a rejected call never touches the caches.
//!
//! The free functions [`sdpa_with_kv_cache`] and
//! [`sdpa_with_kv_cache_shape_only`] keep the flat argument list and use the
//! default kernel.

use candle_core::Tensor;

use crate::config::{BoundsCheck, OpConfig};
use crate::error::SdpaError;
use crate::kernel::{default_kernel, select_kernel, KernelError, SdpaKernel};
use crate::validate::{validate_bounds, validate_params};

/// Optional attention modifiers for one call.
#[derive(Debug, Clone, Copy, Default)]
pub struct SdpaOptions<'a> {
    /// Additive mask `[seq_len, M]`, f32 or f16, `M >= start_pos + seq_len`.
    pub attn_mask: Option<&'a Tensor>,
    /// Dropout probability on the attention weights, in `[0, 1)`.
    pub dropout_p: f64,
    /// Hide cache positions after each query's own position.
    pub is_causal: bool,
    /// Softmax scale; `1 / sqrt(head_dim)` when `None`. Must be finite; zero
    /// gives uniform weights.
    pub scale: Option<f64>,
}

impl<'a> SdpaOptions<'a> {
    pub fn with_mask(mut self, mask: &'a Tensor) -> Self {
        self.attn_mask = Some(mask);
        self
    }

    pub fn with_dropout(mut self, dropout_p: f64) -> Self {
        self.dropout_p = dropout_p;
        self
    }

    pub fn causal(mut self, is_causal: bool) -> Self {
        self.is_causal = is_causal;
        self
    }

    pub fn with_scale(mut self, scale: Option<f64>) -> Self {
        self.scale = scale;
        self
    }
}

/// Scaled dot-product attention over a persistent KV cache.
pub struct SdpaWithKvCache {
    kernel: Box<dyn SdpaKernel>,
    bounds_check: BoundsCheck,
}

impl std::fmt::Debug for SdpaWithKvCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SdpaWithKvCache")
            .field("kernel", &self.kernel.name())
            .field("bounds_check", &self.bounds_check)
            .finish()
    }
}

impl Default for SdpaWithKvCache {
    fn default() -> Self {
        Self::new(default_kernel())
    }
}

impl SdpaWithKvCache {
    pub fn new(kernel: Box<dyn SdpaKernel>) -> Self {
        Self {
            kernel,
            bounds_check: BoundsCheck::default(),
        }
    }

    pub fn with_bounds_check(mut self, bounds_check: BoundsCheck) -> Self {
        self.bounds_check = bounds_check;
        self
    }

    /// Build from resolved configuration. Fails only on an unknown kernel.
    pub fn from_config(config: &OpConfig) -> Result<Self, KernelError> {
        let kernel = select_kernel(config.kernel_name(), config.dropout_seed)?;
        tracing::info!(
            kernel = kernel.name(),
            bounds_check = %config.bounds_check(),
            "sdpa operator ready"
        );
        Ok(Self::new(kernel).with_bounds_check(config.bounds_check()))
    }

    pub fn kernel_name(&self) -> &'static str {
        self.kernel.name()
    }

    pub fn bounds_check(&self) -> BoundsCheck {
        self.bounds_check
    }

    /// Write `key`/`value` at `start_pos` and return attention of `query`
    /// over cache positions `[0, start_pos + seq_len)`.
    ///
    /// Output has the query's shape and dtype. On error the caches are
    /// unchanged.
    #[allow(clippy::too_many_arguments)]
    pub fn compute_and_update_cache(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        key_cache: &mut Tensor,
        value_cache: &mut Tensor,
        start_pos: usize,
        seq_len: usize,
        options: &SdpaOptions<'_>,
    ) -> Result<Tensor, SdpaError> {
        self.check(query, key, value, key_cache, value_cache, start_pos, seq_len, options)?;
        tracing::debug!(
            kernel = self.kernel.name(),
            start_pos,
            valid_len = start_pos.saturating_add(seq_len),
            "sdpa decode step"
        );
        let output = self.kernel.forward(
            query,
            key,
            value,
            key_cache,
            value_cache,
            start_pos,
            options,
        )?;
        Ok(output)
    }

    /// Same validation as [`Self::compute_and_update_cache`], then a
    /// query-shaped output. Neither cache is written and no attention is
    /// computed.
    #[allow(clippy::too_many_arguments)]
    pub fn shape_only(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        key_cache: &Tensor,
        value_cache: &Tensor,
        start_pos: usize,
        seq_len: usize,
        options: &SdpaOptions<'_>,
    ) -> Result<Tensor, SdpaError> {
        self.check(query, key, value, key_cache, value_cache, start_pos, seq_len, options)?;
        tracing::trace!(start_pos, "sdpa shape-only step");
        Ok(query.zeros_like()?)
    }

    #[allow(clippy::too_many_arguments)]
    fn check(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        key_cache: &Tensor,
        value_cache: &Tensor,
        start_pos: usize,
        seq_len: usize,
        options: &SdpaOptions<'_>,
    ) -> Result<(), SdpaError> {
        let checked = validate_params(
            query,
            key,
            value,
            key_cache,
            value_cache,
            start_pos,
            seq_len,
            options.attn_mask,
            options.dropout_p,
            options.is_causal,
            options.scale,
        )
        .and_then(|()| match self.bounds_check {
            BoundsCheck::Enforce => validate_bounds(key_cache, start_pos, seq_len, options.attn_mask),
            BoundsCheck::Relaxed => Ok(()),
        });
        if let Err(err) = &checked {
            tracing::debug!(error = %err, "sdpa call rejected");
        }
        checked
    }
}

/// One decode step with the default kernel and enforced bounds.
#[allow(clippy::too_many_arguments)]
pub fn sdpa_with_kv_cache(
    query: &Tensor,
    key: &Tensor,
    value: &Tensor,
    key_cache: &mut Tensor,
    value_cache: &mut Tensor,
    start_pos: usize,
    seq_len: usize,
    attn_mask: Option<&Tensor>,
    dropout_p: f64,
    is_causal: bool,
    scale: Option<f64>,
) -> Result<Tensor, SdpaError> {
    let options = SdpaOptions {
        attn_mask,
        dropout_p,
        is_causal,
        scale,
    };
    SdpaWithKvCache::default().compute_and_update_cache(
        query,
        key,
        value,
        key_cache,
        value_cache,
        start_pos,
        seq_len,
        &options,
    )
}

/// Shape-only counterpart of [`sdpa_with_kv_cache`].
#[allow(clippy::too_many_arguments)]
pub fn sdpa_with_kv_cache_shape_only(
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
) -> Result<Tensor, SdpaError> {
    let options = SdpaOptions {
        attn_mask,
        dropout_p,
        is_causal,
        scale,
    };
    SdpaWithKvCache::default().shape_only(
        query,
        key,
        value,
        key_cache,
        value_cache,
        start_pos,
        seq_len,
        &options,
    )
}
