//! Single-step scaled dot-product attention over a persistent KV cache.
//!
//! One call writes the step's key/value into caller-owned caches at
//! `start_pos` and attends the query over every cache position written so far.
//! Inputs are validated before anything is mutated.

pub mod cache;
pub mod config;
pub mod error;
pub mod kernel;
pub mod op;
pub mod validate;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use cache::{CacheConfig, KvCacheSession};
pub use config::{BoundsCheck, ConfigError, OpConfig};
pub use error::SdpaError;
pub use kernel::{select_kernel, KernelError, SdpaKernel, AVAILABLE_KERNELS};
pub use op::{sdpa_with_kv_cache, sdpa_with_kv_cache_shape_only, SdpaOptions, SdpaWithKvCache};
pub use validate::{validate_bounds, validate_params};
