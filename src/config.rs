//! Engine configuration loaded from TOML.
//!
//! Lookup order: an explicit path, the `PENUMBRA_CONFIG` environment
//! variable, then `<config dir>/penumbra/engine.toml`. A missing file yields
//! the defaults.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "PENUMBRA_CONFIG";

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Predicate translation limits.
    pub translator: TranslatorConfig,
    /// Planner knobs.
    pub optimizer: OptimizerConfig,
    /// Graph traversal limits.
    pub traversal: TraversalConfig,
    /// Score fusion parameters.
    pub fusion: FusionConfig,
    /// Execution limits.
    pub execution: ExecutionConfig,
}

/// Limits for DNF rewriting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TranslatorConfig {
    /// Conjunction ceiling before falling back to a residual predicate.
    pub max_dnf_conjunctions: usize,
    /// Boolean nesting ceiling before falling back to a residual predicate.
    pub max_dnf_depth: usize,
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self {
            max_dnf_conjunctions: 64,
            max_dnf_depth: 64,
        }
    }
}

/// Planner knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OptimizerConfig {
    /// Maximum rows counted per cardinality estimate.
    pub estimate_sample_cap: u64,
    /// Memory a hash join build side may use.
    pub hash_join_memory_budget_bytes: u64,
    /// Assumed size of one materialized row.
    pub estimated_row_bytes: u64,
    /// Run independent index scans on the rayon pool.
    pub parallel_scans: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            estimate_sample_cap: 10_000,
            hash_join_memory_budget_bytes: 64 * 1024 * 1024,
            estimated_row_bytes: 256,
            parallel_scans: true,
        }
    }
}

/// Traversal limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TraversalConfig {
    /// Frontier size that triggers a warning and a metric; not a hard cap.
    pub max_frontier_size: usize,
    /// Deepest traversal a query may request.
    pub max_depth: u32,
}

impl Default for TraversalConfig {
    fn default() -> Self {
        Self {
            max_frontier_size: 100_000,
            max_depth: 64,
        }
    }
}

/// How ranked lists are combined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionMode {
    /// Reciprocal rank fusion.
    #[default]
    Rrf,
    /// Linear blend of normalized scores.
    Weighted,
}

/// Score fusion parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FusionConfig {
    /// Fusion strategy.
    pub mode: FusionMode,
    /// RRF damping constant.
    pub k: f64,
    /// RRF weight of the vector list.
    pub vector_weight: f64,
    /// RRF weight of the full-text list.
    pub fulltext_weight: f64,
    /// Weighted mode: share of the vector similarity.
    pub alpha: f64,
    /// Drop full-text hits scoring below this before fusion.
    pub min_text_score: Option<f64>,
    /// Drop vector hits farther than this before fusion.
    pub max_vector_distance: Option<f64>,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            mode: FusionMode::Rrf,
            k: 60.0,
            vector_weight: 0.5,
            fulltext_weight: 0.5,
            alpha: 0.5,
            min_text_score: None,
            max_vector_distance: None,
        }
    }
}

/// Execution limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutionConfig {
    /// Deadline per query, if any.
    pub timeout_ms: Option<u64>,
    /// Rows processed between deadline checks.
    pub scan_batch_size: usize,
    /// Page size for cursor queries without LIMIT.
    pub default_page_size: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: None,
            scan_batch_size: 256,
            default_page_size: 1000,
        }
    }
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The config file is not valid TOML for this schema.
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    /// A value parsed but is out of range.
    #[error("invalid config value {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl EngineConfig {
    /// Loads configuration, falling back to defaults when no file exists.
    pub fn load(explicit: Option<PathBuf>) -> Result<Self, ConfigError> {
        let path = explicit
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
            .or_else(default_config_path);
        let config = match path {
            Some(path) if path.exists() => Self::from_file(&path)?,
            _ => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates one TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, reason: &str| {
            Err(ConfigError::Invalid {
                field,
                reason: reason.to_owned(),
            })
        };
        if self.translator.max_dnf_conjunctions == 0 {
            return invalid("translator.max_dnf_conjunctions", "must be positive");
        }
        if self.translator.max_dnf_depth == 0 {
            return invalid("translator.max_dnf_depth", "must be positive");
        }
        if self.optimizer.estimate_sample_cap == 0 {
            return invalid("optimizer.estimate_sample_cap", "must be positive");
        }
        if self.execution.scan_batch_size == 0 {
            return invalid("execution.scan_batch_size", "must be positive");
        }
        if self.execution.default_page_size == 0 {
            return invalid("execution.default_page_size", "must be positive");
        }
        if !(self.fusion.k.is_finite() && self.fusion.k >= 0.0) {
            return invalid("fusion.k", "must be a non-negative number");
        }
        if self.fusion.vector_weight < 0.0 || self.fusion.fulltext_weight < 0.0 {
            return invalid("fusion weights", "must be non-negative");
        }
        if !(0.0..=1.0).contains(&self.fusion.alpha) {
            return invalid("fusion.alpha", "must be within [0, 1]");
        }
        Ok(())
    }
}

/// Default config location under the platform config directory.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join("penumbra").join("engine.toml"))
}
