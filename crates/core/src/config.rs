//! Operator configuration.
//!
//! Resolved with the following priority:
//! 1. CLI arguments (highest priority)
//! 2. Environment (`KVSDPA_KERNEL`, `KVSDPA_BOUNDS_CHECK`, `KVSDPA_DROPOUT_SEED`)
//! 3. Config file (~/.config/kvsdpa/config.toml)
//! 4. Default values (lowest priority)

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::kernel::NaiveSdpaKernel;

pub const ENV_KERNEL: &str = "KVSDPA_KERNEL";
pub const ENV_BOUNDS_CHECK: &str = "KVSDPA_BOUNDS_CHECK";
pub const ENV_DROPOUT_SEED: &str = "KVSDPA_DROPOUT_SEED";

/// Whether cache-capacity and mask-width checks run before the kernel.
///
/// `Relaxed` skips them; an out-of-range write then fails inside the kernel
/// as a backend error, still before the caches are touched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoundsCheck {
    #[default]
    Enforce,
    Relaxed,
}

impl FromStr for BoundsCheck {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "enforce" => Ok(Self::Enforce),
            "relaxed" => Ok(Self::Relaxed),
            other => Err(format!(
                "unknown bounds check policy '{other}' (expected enforce or relaxed)"
            )),
        }
    }
}

impl fmt::Display for BoundsCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Enforce => write!(f, "enforce"),
            Self::Relaxed => write!(f, "relaxed"),
        }
    }
}

/// Persistent configuration stored in TOML format.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpConfig {
    /// Kernel provider name (naive, reference).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kernel: Option<String>,

    /// Bounds check policy (enforce, relaxed).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bounds_check: Option<BoundsCheck>,

    /// Seed for kernels that own a dropout RNG.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dropout_seed: Option<u64>,
}

impl OpConfig {
    pub const DEFAULT_KERNEL: &'static str = NaiveSdpaKernel::NAME;

    /// Get the default config file path.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("kvsdpa").join("config.toml"))
    }

    /// Load configuration from the default path.
    ///
    /// No config directory or no file yields defaults; a file that exists but
    /// cannot be read or parsed is an error.
    pub fn load() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) => Self::load_if_exists(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load `path` when it exists, defaults otherwise.
    pub fn load_if_exists(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load_from(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Save configuration to the default path.
    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let path = Self::default_path().ok_or(ConfigError::NoConfigDir)?;
        self.save_to(&path)?;
        Ok(path)
    }

    /// Save configuration to a specific path, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Merge with another config, preferring values from `other`.
    pub fn merge(&mut self, other: &OpConfig) {
        if other.kernel.is_some() {
            self.kernel = other.kernel.clone();
        }
        if other.bounds_check.is_some() {
            self.bounds_check = other.bounds_check;
        }
        if other.dropout_seed.is_some() {
            self.dropout_seed = other.dropout_seed;
        }
    }

    /// Overlay values from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Overlay values from `lookup`; unparseable values are logged and skipped.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(kernel) = lookup(ENV_KERNEL).filter(|v| !v.trim().is_empty()) {
            self.kernel = Some(kernel);
        }
        if let Some(raw) = lookup(ENV_BOUNDS_CHECK) {
            match raw.parse::<BoundsCheck>() {
                Ok(policy) => self.bounds_check = Some(policy),
                Err(e) => tracing::warn!(var = ENV_BOUNDS_CHECK, "{e}; ignoring"),
            }
        }
        if let Some(raw) = lookup(ENV_DROPOUT_SEED) {
            match raw.trim().parse::<u64>() {
                Ok(seed) => self.dropout_seed = Some(seed),
                Err(e) => tracing::warn!(var = ENV_DROPOUT_SEED, value = %raw, "{e}; ignoring"),
            }
        }
    }

    pub fn kernel_name(&self) -> &str {
        self.kernel.as_deref().unwrap_or(Self::DEFAULT_KERNEL)
    }

    pub fn bounds_check(&self) -> BoundsCheck {
        self.bounds_check.unwrap_or_default()
    }
}

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("No config directory available")]
    NoConfigDir,
}
