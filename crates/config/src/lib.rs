//! Configuration schema and loader for farm nodes.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Number of independent replicas per farm.
    #[serde(default = "default_replicas")]
    pub replicas: usize,

    /// Farm (quorum, fan-out, repair) settings.
    #[serde(default)]
    pub farm: FarmConfig,

    /// Expiry sweeper settings.
    #[serde(default)]
    pub sweeper: SweeperConfig,

    /// Storage settings.
    #[serde(default)]
    pub storage: StorageConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            replicas: default_replicas(),
            farm: FarmConfig::default(),
            sweeper: SweeperConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FarmConfig {
    /// Read strategy: "read_one", "read_quorum", "read_all".
    #[serde(default = "default_strategy")]
    pub strategy: String,

    /// Fraction of replicas contacted by `read_quorum`, in (0, 1].
    #[serde(default = "default_quorum")]
    pub quorum: f64,

    /// Fan-out tactic: "blocking", "non_blocking", "rate_limited".
    #[serde(default = "default_tactic")]
    pub tactic: String,

    /// Sustained element rate for the rate-limited tactic.
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,

    /// Burst capacity for the rate-limited tactic.
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,

    /// Repair timeout in milliseconds.
    #[serde(default = "default_repair_timeout_ms")]
    pub repair_timeout_ms: u64,

    /// Maximum concurrently running background tasks (repairs, full sweeps).
    #[serde(default = "default_max_background_tasks")]
    pub max_background_tasks: usize,

    /// Whether a counter farm tracks cardinality for the data farm.
    #[serde(default = "default_true")]
    pub counter: bool,
}

impl Default for FarmConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            quorum: default_quorum(),
            tactic: default_tactic(),
            rate_limit_per_sec: default_rate_limit_per_sec(),
            rate_limit_burst: default_rate_limit_burst(),
            repair_timeout_ms: default_repair_timeout_ms(),
            max_background_tasks: default_max_background_tasks(),
            counter: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Bucket width of the expiry index, in milliseconds.
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Run a full sweep every this many interval sweeps.
    #[serde(default = "default_full_sweep_every")]
    pub full_sweep_every: u32,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_ms: default_window_ms(),
            full_sweep_every: default_full_sweep_every(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for per-replica WALs. Absent = in-memory replicas.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Key shards per replica engine.
    #[serde(default = "default_shards")]
    pub shards: usize,

    /// Fsync policy: "always", "batch", "none".
    #[serde(default = "default_fsync")]
    pub fsync: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            shards: default_shards(),
            fsync: default_fsync(),
        }
    }
}

// --- Defaults ---

fn default_replicas() -> usize {
    3
}
fn default_strategy() -> String {
    "read_quorum".to_string()
}
fn default_quorum() -> f64 {
    0.51
}
fn default_tactic() -> String {
    "non_blocking".to_string()
}
fn default_rate_limit_per_sec() -> u32 {
    10_000
}
fn default_rate_limit_burst() -> u32 {
    1_000
}
fn default_repair_timeout_ms() -> u64 {
    1000
}
fn default_max_background_tasks() -> usize {
    64
}
fn default_true() -> bool {
    true
}
fn default_window_ms() -> u64 {
    10_000
}
fn default_full_sweep_every() -> u32 {
    10
}
fn default_shards() -> usize {
    16
}
fn default_fsync() -> String {
    "batch".to_string()
}

const STRATEGIES: &[&str] = &["read_one", "read_quorum", "read_all"];
const TACTICS: &[&str] = &["blocking", "non_blocking", "rate_limited"];
const FSYNC_POLICIES: &[&str] = &["always", "batch", "none"];

// --- Loading ---

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl NodeConfig {
    /// Validate that configuration values are consistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.replicas == 0 {
            return Err(ConfigError::Invalid("replicas must be > 0".into()));
        }
        if self.storage.shards == 0 {
            return Err(ConfigError::Invalid("storage.shards must be > 0".into()));
        }
        if !STRATEGIES.contains(&self.farm.strategy.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "farm.strategy {:?} must be one of {:?}",
                self.farm.strategy, STRATEGIES
            )));
        }
        if !(self.farm.quorum > 0.0 && self.farm.quorum <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "farm.quorum ({}) must be in (0, 1]",
                self.farm.quorum
            )));
        }
        if !TACTICS.contains(&self.farm.tactic.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "farm.tactic {:?} must be one of {:?}",
                self.farm.tactic, TACTICS
            )));
        }
        if self.farm.tactic == "rate_limited"
            && (self.farm.rate_limit_per_sec == 0 || self.farm.rate_limit_burst == 0)
        {
            return Err(ConfigError::Invalid(
                "farm.rate_limit_per_sec and farm.rate_limit_burst must be > 0".into(),
            ));
        }
        if self.farm.max_background_tasks == 0 {
            return Err(ConfigError::Invalid(
                "farm.max_background_tasks must be > 0".into(),
            ));
        }
        if self.sweeper.enabled && (self.sweeper.window_ms == 0 || self.sweeper.full_sweep_every == 0)
        {
            return Err(ConfigError::Invalid(
                "sweeper.window_ms and sweeper.full_sweep_every must be > 0".into(),
            ));
        }
        if !FSYNC_POLICIES.contains(&self.storage.fsync.to_lowercase().as_str()) {
            return Err(ConfigError::Invalid(format!(
                "storage.fsync {:?} must be one of {:?}",
                self.storage.fsync, FSYNC_POLICIES
            )));
        }
        Ok(())
    }
}

/// Load a `NodeConfig` from a YAML file path.
pub fn load_from_file(path: &std::path::Path) -> Result<NodeConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    load_from_str(&contents)
}

/// Load a `NodeConfig` from a YAML string.
pub fn load_from_str(yaml: &str) -> Result<NodeConfig, ConfigError> {
    let config: NodeConfig = serde_yaml::from_str(yaml)?;
    config.validate()?;
    Ok(config)
}
