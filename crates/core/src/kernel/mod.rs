//! Pluggable attention kernels for the decode-step operator.
//!
//! A kernel performs the two effectful halves of a step: writing the new
//! key/value into the caller's cache, then attending over the valid prefix.
//! Validation happens before a kernel is ever called (see
//! [`crate::op::SdpaWithKvCache`]), so kernels may assume well-formed inputs.
//!
//! # Providers
//!
//! - [`NaiveSdpaKernel`] (`"naive"`): candle tensor ops (matmul + softmax)
//! - [`ReferenceSdpaKernel`] (`"reference"`): scalar f32 loops, the numerical
//!   baseline other kernels are checked against
//!
//! The provider is chosen once, by name, when the operator is built; an
//! unknown name is a [`KernelError`] for the caller to treat as fatal.

pub mod naive;
pub mod ops;
pub mod reference;

pub use naive::NaiveSdpaKernel;
pub use reference::ReferenceSdpaKernel;

use candle_core::{Result, Tensor};
use thiserror::Error;

use crate::op::SdpaOptions;

/// Names accepted by [`select_kernel`].
pub const AVAILABLE_KERNELS: &[&str] = &[NaiveSdpaKernel::NAME, ReferenceSdpaKernel::NAME];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    #[error("unknown kernel provider '{name}' (available: {available})")]
    Unknown { name: String, available: String },
}

/// Attention kernel trait for pluggable decode-step implementations.
pub trait SdpaKernel: Send + Sync {
    /// Returns the name of this kernel.
    fn name(&self) -> &'static str;

    /// Write `key`/`value` at `start_pos` and attend over the cache.
    ///
    /// # Arguments
    /// * `query` - `[batch, seq_len, num_heads, head_dim]`
    /// * `key`, `value` - `[batch, seq_len, num_kv_heads, head_dim]`
    /// * `key_cache`, `value_cache` - `[batch, capacity, num_kv_heads, head_dim]`,
    ///   updated in place
    /// * `start_pos` - cache position of the first new token
    /// * `options` - mask, dropout, causal flag and scale
    ///
    /// Returns attention output shaped like `query`. Any failure must happen
    /// before the caches are written.
    #[allow(clippy::too_many_arguments)]
    fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        key_cache: &mut Tensor,
        value_cache: &mut Tensor,
        start_pos: usize,
        options: &SdpaOptions<'_>,
    ) -> Result<Tensor>;
}

/// Resolve a kernel provider by name.
///
/// `dropout_seed` makes dropout reproducible for kernels that own their RNG;
/// kernels that delegate dropout to candle ignore it.
pub fn select_kernel(
    name: &str,
    dropout_seed: Option<u64>,
) -> std::result::Result<Box<dyn SdpaKernel>, KernelError> {
    match name.trim().to_ascii_lowercase().as_str() {
        NaiveSdpaKernel::NAME => {
            if dropout_seed.is_some() {
                tracing::warn!("dropout_seed is ignored by the naive kernel");
            }
            Ok(Box::new(NaiveSdpaKernel::new()))
        }
        ReferenceSdpaKernel::NAME => Ok(Box::new(ReferenceSdpaKernel::new(dropout_seed))),
        _ => Err(KernelError::Unknown {
            name: name.to_string(),
            available: AVAILABLE_KERNELS.join(", "),
        }),
    }
}

/// The kernel used when nothing else is configured.
pub fn default_kernel() -> Box<dyn SdpaKernel> {
    Box::new(NaiveSdpaKernel::new())
}
