use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use kvsdpa_core::{BoundsCheck, OpConfig, AVAILABLE_KERNELS};

use kvsdpa_cli::decode::{self, DecodeArgs};
use kvsdpa_cli::logging;

#[derive(Parser)]
#[command(name = "kvsdpa", about = "Single-step attention over a persistent KV cache")]
struct Cli {
    /// Config file (default: ~/.config/kvsdpa/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a synthetic decode session against a fresh cache
    Decode {
        /// Kernel provider (naive, reference)
        #[arg(long)]
        kernel: Option<String>,

        /// Bounds check policy (enforce, relaxed)
        #[arg(long)]
        bounds_check: Option<BoundsCheck>,

        /// Seed for kernels that own a dropout RNG
        #[arg(long)]
        dropout_seed: Option<u64>,

        #[arg(long, default_value_t = 1)]
        batch: usize,

        /// Query heads
        #[arg(long, default_value_t = 8)]
        heads: usize,

        /// Cache heads; must divide the query heads
        #[arg(long, default_value_t = 2)]
        kv_heads: usize,

        #[arg(long, default_value_t = 64)]
        head_dim: usize,

        /// Cache capacity in tokens
        #[arg(long, default_value_t = 128)]
        max_seq_len: usize,

        /// Number of decode steps (default: fill the cache)
        #[arg(long)]
        steps: Option<usize>,

        #[arg(long)]
        causal: bool,

        /// Softmax scale (default: 1/sqrt(head_dim))
        #[arg(long)]
        scale: Option<f64>,

        #[arg(long, default_value_t = 0.0)]
        dropout: f64,

        /// Seed for the synthetic q/k/v
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },
    /// Show or create the config file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Print the config file path
    Path,
    /// Write a config file with the defaults spelled out
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_with_level(&cli.log_level)?;

    match cli.command {
        Command::Decode {
            kernel,
            bounds_check,
            dropout_seed,
            batch,
            heads,
            kv_heads,
            head_dim,
            max_seq_len,
            steps,
            causal,
            scale,
            dropout,
            seed,
        } => {
            let mut config = resolve_config(cli.config.as_deref())?;
            config.merge(&OpConfig {
                kernel,
                bounds_check,
                dropout_seed,
            });

            let args = DecodeArgs {
                batch,
                num_heads: heads,
                num_kv_heads: kv_heads,
                head_dim,
                max_seq_len,
                steps,
                causal,
                scale,
                dropout_p: dropout,
                seed,
            };
            let summary = decode::run(&args, &config)?;
            println!(
                "kernel={} steps={} position={} last_output_norm={:.6}",
                summary.kernel, summary.steps, summary.final_position, summary.last_output_norm
            );
        }
        Command::Config { action } => match action {
            ConfigAction::Show => {
                let config = resolve_config(cli.config.as_deref())?;
                let effective = OpConfig {
                    kernel: Some(config.kernel_name().to_string()),
                    bounds_check: Some(config.bounds_check()),
                    dropout_seed: config.dropout_seed,
                };
                print!("{}", effective.to_toml_string()?);
                println!("# available kernels: {}", AVAILABLE_KERNELS.join(", "));
            }
            ConfigAction::Path => {
                let path = config_path(cli.config.as_deref())?;
                println!("{}", path.display());
            }
            ConfigAction::Init { force } => {
                let path = config_path(cli.config.as_deref())?;
                if path.exists() && !force {
                    anyhow::bail!(
                        "{} already exists (use --force to overwrite)",
                        path.display()
                    );
                }
                let defaults = OpConfig {
                    kernel: Some(OpConfig::DEFAULT_KERNEL.to_string()),
                    bounds_check: Some(BoundsCheck::default()),
                    dropout_seed: None,
                };
                let written = match cli.config.as_deref() {
                    Some(explicit) => defaults.save_to(explicit).map(|()| path.clone()),
                    None => defaults.save(),
                }
                .with_context(|| format!("failed to write {}", path.display()))?;
                tracing::info!(path = %written.display(), "config written");
            }
        },
    }

    Ok(())
}

/// File (explicit or default) overlaid with environment overrides.
///
/// An explicit `--config` must exist and parse. The default location may be
/// absent, but a file that is there must parse.
fn resolve_config(explicit: Option<&Path>) -> anyhow::Result<OpConfig> {
    let mut config = match explicit {
        Some(path) => OpConfig::load_from(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => {
            let path = OpConfig::default_path();
            if let Some(path) = path.as_ref().filter(|p| p.exists()) {
                tracing::debug!(path = %path.display(), "loading config");
            }
            OpConfig::load().with_context(|| match &path {
                Some(path) => format!("failed to load config from {}", path.display()),
                None => "failed to load config".to_string(),
            })?
        }
    };
    config.apply_env_overrides();
    Ok(config)
}

fn config_path(explicit: Option<&Path>) -> anyhow::Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path.to_path_buf()),
        None => OpConfig::default_path().context("no config directory available"),
    }
}
