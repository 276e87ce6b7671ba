//! Synthetic decode session: random q/k/v, one operator call per step.

use std::time::Instant;

use anyhow::Context;
use candle_core::{Device, Tensor};
use kvsdpa_core::{CacheConfig, KvCacheSession, OpConfig, SdpaOptions, SdpaWithKvCache};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Debug, Clone)]
pub struct DecodeArgs {
    pub batch: usize,
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub max_seq_len: usize,
    /// Defaults to filling the cache.
    pub steps: Option<usize>,
    pub causal: bool,
    pub scale: Option<f64>,
    pub dropout_p: f64,
    /// Seed for the synthetic inputs.
    pub seed: u64,
}

impl Default for DecodeArgs {
    fn default() -> Self {
        Self {
            batch: 1,
            num_heads: 8,
            num_kv_heads: 2,
            head_dim: 64,
            max_seq_len: 128,
            steps: None,
            causal: false,
            scale: None,
            dropout_p: 0.0,
            seed: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodeSummary {
    pub kernel: &'static str,
    pub steps: usize,
    pub final_position: usize,
    pub last_output_norm: f32,
}

/// Resolve the operator from `config` and run the session.
///
/// An unknown kernel provider fails here, before any cache is allocated.
pub fn run(args: &DecodeArgs, config: &OpConfig) -> anyhow::Result<DecodeSummary> {
    let op = SdpaWithKvCache::from_config(config).context("failed to resolve kernel provider")?;
    let mut session = KvCacheSession::new(&CacheConfig {
        batch_size: args.batch,
        max_seq_len: args.max_seq_len,
        num_kv_heads: args.num_kv_heads,
        head_dim: args.head_dim,
        device: Device::Cpu,
    })?;

    let steps = args.steps.unwrap_or(args.max_seq_len);
    let options = SdpaOptions::default()
        .causal(args.causal)
        .with_scale(args.scale)
        .with_dropout(args.dropout_p);
    let mut rng = StdRng::seed_from_u64(args.seed);
    let mut last_output_norm = 0.0;
    let start = Instant::now();

    for step in 0..steps {
        let query = random_tensor(&mut rng, (args.batch, 1, args.num_heads, args.head_dim))?;
        let key = random_tensor(&mut rng, (args.batch, 1, args.num_kv_heads, args.head_dim))?;
        let value = random_tensor(&mut rng, (args.batch, 1, args.num_kv_heads, args.head_dim))?;

        let output = session
            .step(&op, &query, &key, &value, &options)
            .with_context(|| format!("decode step {step} failed"))?;
        last_output_norm = output.sqr()?.sum_all()?.to_scalar::<f32>()?.sqrt();
        tracing::debug!(step, position = session.position(), last_output_norm, "decode step");
    }

    let elapsed = start.elapsed();
    tracing::info!(
        kernel = op.kernel_name(),
        steps,
        position = session.position(),
        elapsed_ms = elapsed.as_secs_f64() * 1e3,
        "decode session complete"
    );

    Ok(DecodeSummary {
        kernel: op.kernel_name(),
        steps,
        final_position: session.position(),
        last_output_norm,
    })
}

fn random_tensor(
    rng: &mut StdRng,
    shape: (usize, usize, usize, usize),
) -> candle_core::Result<Tensor> {
    let (a, b, c, d) = shape;
    let data: Vec<f32> = (0..a * b * c * d)
        .map(|_| rng.gen_range(-1.0f32..1.0))
        .collect();
    Tensor::from_vec(data, shape, &Device::Cpu)
}
