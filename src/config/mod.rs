//! Configuration for the coordinator and the simulation tool.
//!
//! Configuration is loaded with precedence: CLI args > Env vars > Config file > Defaults
//!
//! # Example config file (shardmerge.toml)
//! ```toml
//! [coordinator]
//! shard_timeout_ms = 2000
//! shard_number_multiplier = 3
//! finish_round = true
//!
//! [cluster]
//! shards = [0, 1, 2, 3]
//!
//! [simulation]
//! seed = 7
//! ```

mod defaults;

pub use defaults::*;

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::transport::ShardId;

/// Main configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardMergeConfig {
    /// Round and protocol settings
    pub coordinator: CoordinatorConfig,
    /// Shards taking part in queries
    pub cluster: ClusterConfig,
    /// In-process simulated shards
    pub simulation: SimulationConfig,
}

impl ShardMergeConfig {
    /// Load configuration with precedence: CLI args > Env > File > Defaults
    ///
    /// # Arguments
    /// * `config_path` - Optional path to TOML config file
    /// * `overrides` - CLI overrides to apply on top
    pub fn load(
        config_path: Option<&str>,
        overrides: ConfigOverrides,
    ) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(ShardMergeConfig::default()));

        // Layer 1: Config file (if provided)
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        // Layer 2: Environment variables with SHARDMERGE_ prefix
        figment = figment.merge(Env::prefixed("SHARDMERGE_").split("__"));

        // Layer 3: CLI overrides
        figment = figment.merge(Serialized::defaults(overrides));

        figment.extract().map_err(ConfigError::from)
    }

    /// Load from environment and optional config file only (no CLI overrides)
    pub fn from_env(config_path: Option<&str>) -> Result<Self, ConfigError> {
        Self::load(config_path, ConfigOverrides::default())
    }
}

/// Top-K coordinator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Per-shard request timeout (milliseconds)
    pub shard_timeout_ms: u64,
    /// Initial per-shard size as a multiple of the global size
    pub shard_number_multiplier: i64,
    /// Global size used when a query does not set one
    pub default_number: i64,
    /// Cap on aggregations produced by variable expansion
    pub max_expansion: usize,
    /// Run the boundary refinement round
    pub missing_top_round: bool,
    /// Run the key reconciliation round
    pub missing_key_round: bool,
    /// Run the display round after truncation
    pub finish_round: bool,
}

impl CoordinatorConfig {
    pub fn shard_timeout(&self) -> Duration {
        Duration::from_millis(self.shard_timeout_ms)
    }

    /// Entries an aggregation asking for `number` ends up with: 0 takes
    /// `default_number`, a negative number keeps everything.
    pub fn resolve_number(&self, number: i64) -> i64 {
        if number == 0 {
            self.default_number
        } else {
            number
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            shard_timeout_ms: DEFAULT_SHARD_TIMEOUT_MS,
            shard_number_multiplier: DEFAULT_SHARD_NUMBER_MULTIPLIER,
            default_number: DEFAULT_NUMBER,
            max_expansion: DEFAULT_MAX_EXPANSION,
            missing_top_round: DEFAULT_MISSING_TOP_ROUND,
            missing_key_round: DEFAULT_MISSING_KEY_ROUND,
            finish_round: DEFAULT_FINISH_ROUND,
        }
    }
}

/// Shard membership.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Shard ids
    pub shards: Vec<u32>,
    /// File containing shard ids (one per line), used instead of `shards`
    pub shards_file: Option<PathBuf>,
}

impl ClusterConfig {
    /// Shard ids from the file if one is configured, else from `shards`.
    pub fn resolve_shards(&self) -> Result<Vec<ShardId>, ConfigError> {
        match &self.shards_file {
            Some(path) => read_shards_file(path),
            None => Ok(self.shards.iter().copied().map(ShardId).collect()),
        }
    }
}

fn read_shards_file(path: &Path) -> Result<Vec<ShardId>, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError {
        message: format!("cannot read {}: {e}", path.display()),
    })?;
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| {
            line.parse::<u32>().map(ShardId).map_err(|_| ConfigError {
                message: format!("invalid shard id {line:?} in {}", path.display()),
            })
        })
        .collect()
}

/// Data generated for the simulated cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub shards: usize,
    pub keys_per_shard: usize,
    pub vocabulary: usize,
    pub max_count: u64,
    pub seed: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            shards: DEFAULT_SIM_SHARDS,
            keys_per_shard: DEFAULT_SIM_KEYS_PER_SHARD,
            vocabulary: DEFAULT_SIM_VOCABULARY,
            max_count: DEFAULT_SIM_MAX_COUNT,
            seed: DEFAULT_SIM_SEED,
        }
    }
}

/// CLI overrides that take precedence over file and env config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coordinator: Option<CoordinatorOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster: Option<ClusterOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub simulation: Option<SimulationOverrides>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_number: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_round: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shards: Option<Vec<u32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shards_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shards: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

/// Configuration error.
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "configuration error: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        Self {
            message: e.to_string(),
        }
    }
}
