//! Configuration for the knowledge base, persisted as TOML.
//!
//! Every field has a serde default, so a partial (or empty) file is valid.
//! The default location is `$XDG_CONFIG_HOME/strata/config.toml`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Placement, budget and backpressure tuning for the abstraction governor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    /// Weight of reuse (uses + contexts) in the placement score.
    pub reuse_weight: f32,
    /// Weight of content richness in the placement score.
    pub richness_weight: f32,
    /// Bonus added when the record carries tests.
    pub test_bonus: f32,
    /// Use count at which the reuse signal saturates.
    pub use_saturation: u64,
    /// Distinct-context count at which the reuse signal saturates.
    pub context_saturation: usize,
    /// definitions + invariants + examples count at which richness saturates.
    pub richness_saturation: usize,
    pub kernel_min_score: f32,
    pub kernel_min_uses: u64,
    pub kernel_min_contexts: usize,
    pub aggregate_min_score: f32,
    pub aggregate_min_uses: u64,
    pub aggregate_min_contexts: usize,
    /// `added - collapsed` above this triggers backpressure.
    pub backpressure_threshold: u64,
    /// Days between periodic upgrade cycles.
    pub upgrade_cadence_days: u64,
    pub default_reasoning_depth: u8,
    pub default_min_crispness: f32,
    pub crispness_step: f32,
    pub max_crispness: f32,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            reuse_weight: 0.6,
            richness_weight: 0.35,
            test_bonus: 0.05,
            use_saturation: 12,
            context_saturation: 6,
            richness_saturation: 6,
            kernel_min_score: 0.90,
            kernel_min_uses: 12,
            kernel_min_contexts: 6,
            aggregate_min_score: 0.75,
            aggregate_min_uses: 6,
            aggregate_min_contexts: 3,
            backpressure_threshold: 5,
            upgrade_cadence_days: 10,
            default_reasoning_depth: 3,
            default_min_crispness: 0.30,
            crispness_step: 0.05,
            max_crispness: 0.90,
        }
    }
}

impl GovernorConfig {
    pub fn upgrade_cadence_secs(&self) -> u64 {
        self.upgrade_cadence_days * 24 * 60 * 60
    }
}

/// Clustering and synthesis limits for auto-promotion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromotionConfig {
    /// Cold-store guard: cumulative usage required before promoting.
    pub min_total_usage: u64,
    pub tag_jaccard: f32,
    pub token_jaccard: f32,
    pub min_cluster: usize,
    pub max_cluster: usize,
    /// Maximum items per content block in a synthesized record.
    pub content_cap: usize,
    pub max_new_aggregates: usize,
    pub max_new_kernels: usize,
    /// Canonical aggregates required before a kernel can be synthesized.
    pub kernel_min_aggregates: usize,
}

impl Default for PromotionConfig {
    fn default() -> Self {
        Self {
            min_total_usage: 25,
            tag_jaccard: 0.30,
            token_jaccard: 0.12,
            min_cluster: 4,
            max_cluster: 7,
            content_cap: 12,
            max_new_aggregates: 2,
            max_new_kernels: 1,
            kernel_min_aggregates: 2,
        }
    }
}

/// Default working-set budgets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    pub peripheral: usize,
    pub focus: usize,
    pub micro: usize,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            peripheral: 5000,
            focus: 500,
            micro: 50,
        }
    }
}

/// Write-behind persistence tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub flush_interval_ms: u64,
    /// Pre-install snapshots kept in memory-only mode.
    pub memory_snapshots: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 2000,
            memory_snapshots: crate::store::snapshot::DEFAULT_MEMORY_RETENTION,
        }
    }
}

impl PersistenceConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

/// Full configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrataConfig {
    /// Maximum tags kept per record.
    #[serde(default = "default_tag_cap")]
    pub tag_cap: usize,
    /// Minimum policy-gate richness.
    #[serde(default = "default_min_richness")]
    pub min_richness: usize,
    #[serde(default)]
    pub governor: GovernorConfig,
    #[serde(default)]
    pub promotion: PromotionConfig,
    #[serde(default)]
    pub selection: SelectionConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

fn default_tag_cap() -> usize {
    40
}
fn default_min_richness() -> usize {
    2
}

impl Default for StrataConfig {
    fn default() -> Self {
        Self {
            tag_cap: default_tag_cap(),
            min_richness: default_min_richness(),
            governor: GovernorConfig::default(),
            promotion: PromotionConfig::default(),
            selection: SelectionConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

impl StrataConfig {
    /// Reject settings the pipeline cannot honor.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.tag_cap == 0 {
            return Err(ConfigError::Invalid {
                message: "tag_cap must be > 0".into(),
            });
        }
        let p = &self.promotion;
        if p.min_cluster == 0 || p.min_cluster > p.max_cluster {
            return Err(ConfigError::Invalid {
                message: format!(
                    "promotion cluster bounds must satisfy 0 < min ({}) <= max ({})",
                    p.min_cluster, p.max_cluster
                ),
            });
        }
        let s = &self.selection;
        if s.micro > s.focus || s.focus > s.peripheral {
            return Err(ConfigError::Invalid {
                message: "selection budgets must satisfy micro <= focus <= peripheral".into(),
            });
        }
        if self.persistence.memory_snapshots == 0 {
            return Err(ConfigError::Invalid {
                message: "persistence.memory_snapshots must be > 0".into(),
            });
        }
        let g = &self.governor;
        if g.default_min_crispness > g.max_crispness {
            return Err(ConfigError::Invalid {
                message: "default_min_crispness must not exceed max_crispness".into(),
            });
        }
        Ok(())
    }

    /// Load from a TOML file.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> ConfigResult<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save to a TOML file.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
        std::fs::write(path, content).map_err(|e| ConfigError::Write {
            path: path.display().to_string(),
            source: e,
        })
    }
}

/// Runtime configuration: file settings plus where (if anywhere) to persist.
#[derive(Debug, Clone, Default)]
pub struct KbConfig {
    pub settings: StrataConfig,
    /// Data directory for persistence. `None` for memory-only mode.
    pub data_dir: Option<PathBuf>,
}

impl KbConfig {
    pub fn memory() -> Self {
        Self::default()
    }

    pub fn persistent(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            settings: StrataConfig::default(),
            data_dir: Some(data_dir.into()),
        }
    }
}
