//! Engine configuration.
//!
//! The engine is constructed from a single JSON options blob. This module
//! turns that blob into [`EmbeddingOptions`] and validates it eagerly, so a
//! malformed blob is rejected at construction instead of surfacing as a
//! failed lookup later.
//!
//! # Example
//!
//! ```
//! use oneembed_core::config::{EmbeddingOptions, OptimizerKind};
//!
//! let options = EmbeddingOptions::from_json(r#"{
//!     "embedding_name": "user",
//!     "embedding_size": 16,
//!     "l1_cache": {"policy": "lru", "cache_memory_budget_mb": 64},
//!     "l2_cache": {"policy": "none"},
//!     "fixed_table": {"path": "/tmp/user_table", "block_size": 512, "chunk_size": 4194304},
//!     "initializer": {"type": "uniform", "mean": 0, "std": 1},
//!     "optimizer": {"type": "sgd"},
//!     "learning_rate_schedule": {"learning_rate": 0.1}
//! }"#).unwrap();
//!
//! assert_eq!(options.embedding_size, 16);
//! assert_eq!(options.optimizer.kind, OptimizerKind::Sgd);
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EmbeddingError, Result};

const MIB: u64 = 1024 * 1024;

/// Element type of typed lookup output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// 32-bit IEEE floats.
    #[default]
    Float32,
    /// 16-bit IEEE floats.
    Float16,
}

/// Residency policy of an in-memory cache tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CachePolicy {
    /// Least-recently-used eviction under a memory budget.
    Lru,
    /// Tier disabled; records pass straight through it.
    None,
}

/// Configuration of one in-memory cache tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheOptions {
    /// Eviction policy.
    pub policy: CachePolicy,
    /// Memory ceiling in MiB. Required for `lru`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_memory_budget_mb: Option<u64>,
}

impl CacheOptions {
    /// An LRU tier with the given budget.
    pub fn lru(budget_mb: u64) -> Self {
        Self {
            policy: CachePolicy::Lru,
            cache_memory_budget_mb: Some(budget_mb),
        }
    }

    /// A disabled tier.
    pub fn disabled() -> Self {
        Self {
            policy: CachePolicy::None,
            cache_memory_budget_mb: None,
        }
    }

    /// Returns `true` unless the policy is `none`.
    pub fn is_enabled(&self) -> bool {
        self.policy != CachePolicy::None
    }

    /// Returns the budget in bytes, or 0 for a disabled tier.
    pub fn budget_bytes(&self) -> u64 {
        match self.policy {
            CachePolicy::None => 0,
            CachePolicy::Lru => self.cache_memory_budget_mb.unwrap_or(0).saturating_mul(MIB),
        }
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.policy == CachePolicy::Lru && self.cache_memory_budget_mb.is_none() {
            return Err(EmbeddingError::config(format!(
                "{name}.cache_memory_budget_mb is required for the lru policy"
            )));
        }
        Ok(())
    }
}

fn default_l1_cache() -> CacheOptions {
    CacheOptions::lru(8192)
}

fn default_block_size() -> u64 {
    512
}

fn default_chunk_size() -> u64 {
    4 * MIB
}

/// Configuration of the persistent block-structured table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixedTableOptions {
    /// Directory holding the table's chunk files.
    pub path: Option<PathBuf>,
    /// Size in bytes of one storage block.
    #[serde(default = "default_block_size")]
    pub block_size: u64,
    /// Size in bytes of one chunk file. Must be a multiple of `block_size`.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
}

impl FixedTableOptions {
    /// A table rooted at `path` with the default block and chunk sizes.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            block_size: default_block_size(),
            chunk_size: default_chunk_size(),
        }
    }

    /// Number of blocks in one chunk.
    pub fn blocks_per_chunk(&self) -> u64 {
        self.chunk_size / self.block_size.max(1)
    }

    fn validate(&self) -> Result<()> {
        if self.path.is_none() {
            return Err(EmbeddingError::config("fixed_table.path is required"));
        }
        if self.block_size == 0 {
            return Err(EmbeddingError::config(
                "fixed_table.block_size must be positive",
            ));
        }
        if self.chunk_size < self.block_size || self.chunk_size % self.block_size != 0 {
            return Err(EmbeddingError::config(format!(
                "fixed_table.chunk_size ({}) must be a positive multiple of block_size ({})",
                self.chunk_size, self.block_size
            )));
        }
        Ok(())
    }
}

/// Distribution used to initialize unseen keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitializerKind {
    /// Uniform distribution with the given mean and standard deviation.
    Uniform,
    /// Normal distribution with the given mean and standard deviation.
    Normal,
    /// Every value equals `value`.
    Constant,
    /// Every value is zero.
    Zeros,
}

/// Initializer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitializerOptions {
    /// Distribution type.
    #[serde(rename = "type")]
    pub kind: InitializerKind,
    /// Distribution mean.
    #[serde(default)]
    pub mean: f32,
    /// Distribution standard deviation.
    #[serde(default = "default_std")]
    pub std: f32,
    /// Fill value for `constant`.
    #[serde(default)]
    pub value: f32,
    /// Seed combined with each key to derive its values.
    #[serde(default)]
    pub seed: u64,
}

fn default_std() -> f32 {
    1.0
}

impl Default for InitializerOptions {
    fn default() -> Self {
        Self {
            kind: InitializerKind::Uniform,
            mean: 0.0,
            std: 1.0,
            value: 0.0,
            seed: 0,
        }
    }
}

impl InitializerOptions {
    fn validate(&self) -> Result<()> {
        if !self.mean.is_finite() || !self.value.is_finite() {
            return Err(EmbeddingError::config(
                "initializer mean and value must be finite",
            ));
        }
        if !self.std.is_finite() || self.std < 0.0 {
            return Err(EmbeddingError::config(format!(
                "initializer.std ({}) must be finite and non-negative",
                self.std
            )));
        }
        Ok(())
    }
}

/// Update rule applied on the backward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    /// Plain stochastic gradient descent.
    Sgd,
    /// SGD with a velocity term scaled by `beta`.
    Momentum,
    /// Two-moment adaptive update.
    Adam,
    /// Accumulated squared-gradient adaptive update.
    Adagrad,
}

impl OptimizerKind {
    /// Name as it appears in the options blob.
    pub fn name(self) -> &'static str {
        match self {
            OptimizerKind::Sgd => "sgd",
            OptimizerKind::Momentum => "momentum",
            OptimizerKind::Adam => "adam",
            OptimizerKind::Adagrad => "adagrad",
        }
    }
}

/// Optimizer configuration.
///
/// The blob carries every hyperparameter regardless of `type`; each rule
/// reads the ones it needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerOptions {
    /// Update rule.
    #[serde(rename = "type")]
    pub kind: OptimizerKind,
    /// Momentum coefficient.
    #[serde(default = "default_beta")]
    pub beta: f32,
    /// First-moment decay.
    #[serde(default = "default_beta")]
    pub beta1: f32,
    /// Second-moment decay.
    #[serde(default = "default_beta2")]
    pub beta2: f32,
    /// Denominator stabilizer.
    #[serde(default = "default_epsilon")]
    pub epsilon: f32,
    /// Whether adaptive updates correct moment bias.
    #[serde(default = "default_true")]
    pub do_bias_correction: bool,
    /// Decoupled weight decay coefficient.
    #[serde(default)]
    pub weight_decay: f32,
}

fn default_beta() -> f32 {
    0.9
}

fn default_beta2() -> f32 {
    0.999
}

fn default_epsilon() -> f32 {
    1e-8
}

fn default_true() -> bool {
    true
}

impl Default for OptimizerOptions {
    fn default() -> Self {
        Self {
            kind: OptimizerKind::Sgd,
            beta: default_beta(),
            beta1: default_beta(),
            beta2: default_beta2(),
            epsilon: default_epsilon(),
            do_bias_correction: true,
            weight_decay: 0.0,
        }
    }
}

impl OptimizerOptions {
    /// Default hyperparameters for the given rule.
    pub fn of(kind: OptimizerKind) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }

    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("beta", self.beta),
            ("beta1", self.beta1),
            ("beta2", self.beta2),
        ] {
            if !(0.0..1.0).contains(&value) {
                return Err(EmbeddingError::config(format!(
                    "optimizer.{name} ({value}) must be in [0, 1)"
                )));
            }
        }
        if !(self.epsilon.is_finite() && self.epsilon > 0.0) {
            return Err(EmbeddingError::config(format!(
                "optimizer.epsilon ({}) must be positive",
                self.epsilon
            )));
        }
        if !(self.weight_decay.is_finite() && self.weight_decay >= 0.0) {
            return Err(EmbeddingError::config(format!(
                "optimizer.weight_decay ({}) must be non-negative",
                self.weight_decay
            )));
        }
        Ok(())
    }
}

/// Decay curve applied after warmup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecayKind {
    /// `(lr - end) * (1 - t / decay_batches)^power + end`.
    Polynomial,
}

/// Learning-rate decay configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecayOptions {
    /// Decay curve.
    #[serde(rename = "type")]
    pub kind: DecayKind,
    /// Number of batches over which the rate decays.
    pub decay_batches: u64,
    /// Rate reached at the end of decay.
    #[serde(default)]
    pub end_learning_rate: f32,
    /// Polynomial exponent.
    #[serde(default = "default_power")]
    pub power: f32,
    /// Restart the decay every `decay_batches` instead of holding the end rate.
    #[serde(default)]
    pub cycle: bool,
}

fn default_power() -> f32 {
    1.0
}

/// Warmup ramp shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WarmupKind {
    /// Linear ramp from `start_multiplier * lr` to `lr`.
    Linear,
}

/// Learning-rate warmup configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarmupOptions {
    /// Ramp shape.
    #[serde(rename = "type")]
    pub kind: WarmupKind,
    /// Number of warmup batches. Zero disables warmup.
    pub warmup_batches: u64,
    /// Fraction of the base rate used at step 0.
    #[serde(default)]
    pub start_multiplier: f32,
}

/// Learning-rate schedule configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningRateScheduleOptions {
    /// Base learning rate.
    pub learning_rate: f32,
    /// Optional decay after warmup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub learning_rate_decay: Option<DecayOptions>,
    /// Optional warmup ramp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warmup: Option<WarmupOptions>,
}

impl LearningRateScheduleOptions {
    /// A constant rate with no warmup or decay.
    pub fn constant(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            learning_rate_decay: None,
            warmup: None,
        }
    }

    fn validate(&self) -> Result<()> {
        if !(self.learning_rate.is_finite() && self.learning_rate >= 0.0) {
            return Err(EmbeddingError::config(format!(
                "learning_rate_schedule.learning_rate ({}) must be non-negative",
                self.learning_rate
            )));
        }
        if let Some(decay) = &self.learning_rate_decay {
            if decay.decay_batches == 0 {
                return Err(EmbeddingError::config(
                    "learning_rate_decay.decay_batches must be positive",
                ));
            }
            if !(decay.end_learning_rate.is_finite() && decay.end_learning_rate >= 0.0) {
                return Err(EmbeddingError::config(
                    "learning_rate_decay.end_learning_rate must be non-negative",
                ));
            }
            if !(decay.power.is_finite() && decay.power > 0.0) {
                return Err(EmbeddingError::config(
                    "learning_rate_decay.power must be positive",
                ));
            }
        }
        if let Some(warmup) = &self.warmup {
            if !(warmup.start_multiplier.is_finite() && warmup.start_multiplier >= 0.0) {
                return Err(EmbeddingError::config(
                    "warmup.start_multiplier must be non-negative",
                ));
            }
        }
        Ok(())
    }
}

/// Execution knobs that were process-wide toggles in earlier deployments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeOptions {
    /// Worker threads resolving keys within a batch.
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    /// Number of key lock stripes.
    #[serde(default = "default_num_shards")]
    pub num_shards: usize,
    /// Fixed-table I/O budget per batch, in milliseconds.
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,
}

fn default_num_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_num_shards() -> usize {
    64
}

fn default_io_timeout_ms() -> u64 {
    30_000
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            num_workers: default_num_workers(),
            num_shards: default_num_shards(),
            io_timeout_ms: default_io_timeout_ms(),
        }
    }
}

impl RuntimeOptions {
    /// The I/O timeout as a [`Duration`].
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.num_workers == 0 {
            return Err(EmbeddingError::config("runtime.num_workers must be positive"));
        }
        if self.num_shards == 0 {
            return Err(EmbeddingError::config("runtime.num_shards must be positive"));
        }
        if self.io_timeout_ms == 0 {
            return Err(EmbeddingError::config("runtime.io_timeout_ms must be positive"));
        }
        Ok(())
    }
}

fn default_l2_cache() -> CacheOptions {
    CacheOptions::disabled()
}

/// The full options blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingOptions {
    /// Table name, used in logs and table metadata.
    pub embedding_name: String,
    /// Width of every embedding vector.
    pub embedding_size: usize,
    /// Element type of typed lookups.
    #[serde(default)]
    pub dtype: DataType,
    /// Hot cache tier.
    #[serde(default = "default_l1_cache")]
    pub l1_cache: CacheOptions,
    /// Optional second cache tier.
    #[serde(default = "default_l2_cache")]
    pub l2_cache: CacheOptions,
    /// Persistent table.
    pub fixed_table: FixedTableOptions,
    /// Initializer for unseen keys.
    #[serde(default)]
    pub initializer: InitializerOptions,
    /// Update rule.
    #[serde(default)]
    pub optimizer: OptimizerOptions,
    /// Learning-rate schedule.
    pub learning_rate_schedule: LearningRateScheduleOptions,
    /// Execution knobs.
    #[serde(default)]
    pub runtime: RuntimeOptions,
}

impl EmbeddingOptions {
    /// Options with the stock defaults for the given table.
    pub fn new(
        embedding_name: impl Into<String>,
        embedding_size: usize,
        path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            embedding_name: embedding_name.into(),
            embedding_size,
            dtype: DataType::Float32,
            l1_cache: default_l1_cache(),
            l2_cache: default_l2_cache(),
            fixed_table: FixedTableOptions::at(path),
            initializer: InitializerOptions::default(),
            optimizer: OptimizerOptions::default(),
            learning_rate_schedule: LearningRateScheduleOptions {
                learning_rate: 24.0,
                learning_rate_decay: Some(DecayOptions {
                    kind: DecayKind::Polynomial,
                    decay_batches: 27772,
                    end_learning_rate: 0.0,
                    power: 2.0,
                    cycle: false,
                }),
                warmup: Some(WarmupOptions {
                    kind: WarmupKind::Linear,
                    warmup_batches: 2750,
                    start_multiplier: 0.0,
                }),
            },
            runtime: RuntimeOptions::default(),
        }
    }

    /// Parses and validates an options blob.
    pub fn from_json(blob: &str) -> Result<Self> {
        let options: Self = serde_json::from_str(blob)
            .map_err(|e| EmbeddingError::config(format!("malformed options blob: {e}")))?;
        options.validate()?;
        Ok(options)
    }

    /// Serializes the options back into a blob.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| EmbeddingError::config(format!("cannot serialize options: {e}")))
    }

    /// Validates every section.
    pub fn validate(&self) -> Result<()> {
        if self.embedding_name.trim().is_empty() {
            return Err(EmbeddingError::config("embedding_name must not be empty"));
        }
        if self.embedding_size == 0 {
            return Err(EmbeddingError::config("embedding_size must be positive"));
        }
        if !self.l1_cache.is_enabled() {
            return Err(EmbeddingError::config(
                "l1_cache cannot use the none policy",
            ));
        }
        self.l1_cache.validate("l1_cache")?;
        self.l2_cache.validate("l2_cache")?;
        self.fixed_table.validate()?;
        self.initializer.validate()?;
        self.optimizer.validate()?;
        self.learning_rate_schedule.validate()?;
        self.runtime.validate()?;
        Ok(())
    }

    /// Directory of the fixed table.
    pub fn table_path(&self) -> Result<&std::path::Path> {
        self.fixed_table
            .path
            .as_deref()
            .ok_or_else(|| EmbeddingError::config("fixed_table.path is required"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn original_blob() -> String {
        r#"{
            "embedding_name": "EmbeddingTest",
            "embedding_size": 128,
            "l1_cache": {"policy": "lru", "cache_memory_budget_mb": 8192},
            "l2_cache": {"policy": "none"},
            "fixed_table": {"path": "/data/table", "block_size": 512, "chunk_size": 4194304},
            "initializer": {"type": "uniform", "mean": 0, "std": 1},
            "optimizer": {
                "type": "sgd", "beta": 0.9, "beta1": 0.9, "beta2": 0.999,
                "epsilon": 1e-8, "do_bias_correction": true
            },
            "learning_rate_schedule": {
                "learning_rate": 24,
                "learning_rate_decay": {
                    "type": "polynomial", "decay_batches": 27772,
                    "end_learning_rate": 0.0, "power": 2.0, "cycle": false
                },
                "warmup": {"type": "linear", "warmup_batches": 2750, "start_multiplier": 0.0}
            }
        }"#
        .to_string()
    }

    #[test]
    fn test_parse_original_blob() {
        let options = EmbeddingOptions::from_json(&original_blob()).unwrap();
        assert_eq!(options.embedding_name, "EmbeddingTest");
        assert_eq!(options.embedding_size, 128);
        assert_eq!(options.l1_cache.budget_bytes(), 8192 * MIB);
        assert!(!options.l2_cache.is_enabled());
        assert_eq!(options.fixed_table.blocks_per_chunk(), 8192);
        assert_eq!(options.optimizer.kind, OptimizerKind::Sgd);
        assert!(options.optimizer.do_bias_correction);

        let decay = options.learning_rate_schedule.learning_rate_decay.unwrap();
        assert_eq!(decay.decay_batches, 27772);
        assert_eq!(decay.power, 2.0);
        let warmup = options.learning_rate_schedule.warmup.unwrap();
        assert_eq!(warmup.warmup_batches, 2750);
    }

    #[test]
    fn test_defaults_match_stock_options() {
        let stock = EmbeddingOptions::new("EmbeddingTest", 128, "/data/table");
        let parsed = EmbeddingOptions::from_json(&original_blob()).unwrap();
        assert_eq!(stock.l1_cache, parsed.l1_cache);
        assert_eq!(stock.fixed_table, parsed.fixed_table);
        assert_eq!(stock.learning_rate_schedule, parsed.learning_rate_schedule);
        assert_eq!(stock.initializer, parsed.initializer);
    }

    #[test]
    fn test_json_round_trip() {
        let options = EmbeddingOptions::new("t", 8, "/tmp/t");
        let blob = options.to_json().unwrap();
        let parsed = EmbeddingOptions::from_json(&blob).unwrap();
        assert_eq!(options, parsed);
    }

    #[test]
    fn test_missing_path_rejected() {
        let blob = original_blob().replace(r#""path": "/data/table""#, r#""path": null"#);
        let err = EmbeddingOptions::from_json(&blob).unwrap_err();
        assert!(err.to_string().contains("fixed_table.path"), "{err}");
    }

    #[test]
    fn test_chunk_not_multiple_of_block_rejected() {
        let blob = original_blob().replace("4194304", "1000");
        let err = EmbeddingOptions::from_json(&blob).unwrap_err();
        assert!(matches!(err, EmbeddingError::Configuration { .. }));
        assert!(err.to_string().contains("multiple of block_size"));
    }

    #[test]
    fn test_unknown_optimizer_rejected() {
        let blob = original_blob().replace(r#""type": "sgd""#, r#""type": "lamb""#);
        let err = EmbeddingOptions::from_json(&blob).unwrap_err();
        assert!(err.to_string().contains("malformed options blob"), "{err}");
    }

    #[test]
    fn test_lru_requires_budget() {
        let blob = original_blob().replace(
            r#"{"policy": "lru", "cache_memory_budget_mb": 8192}"#,
            r#"{"policy": "lru"}"#,
        );
        let err = EmbeddingOptions::from_json(&blob).unwrap_err();
        assert!(err.to_string().contains("cache_memory_budget_mb"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut options = EmbeddingOptions::new("t", 0, "/tmp/t");
        assert!(options.validate().is_err());

        options.embedding_size = 4;
        options.optimizer.beta2 = 1.0;
        assert!(options.validate().is_err());

        options.optimizer.beta2 = 0.999;
        options.initializer.std = -1.0;
        assert!(options.validate().is_err());

        options.initializer.std = 1.0;
        options.runtime.num_shards = 0;
        assert!(options.validate().is_err());

        options.runtime.num_shards = 4;
        options.l1_cache = CacheOptions::disabled();
        assert!(options.validate().is_err());

        options.l1_cache = CacheOptions::lru(1);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_optional_sections_default() {
        let options = EmbeddingOptions::from_json(
            r#"{
                "embedding_name": "t",
                "embedding_size": 4,
                "fixed_table": {"path": "/tmp/t"},
                "learning_rate_schedule": {"learning_rate": 0.5}
            }"#,
        )
        .unwrap();
        assert_eq!(options.l1_cache, CacheOptions::lru(8192));
        assert_eq!(options.fixed_table.block_size, 512);
        assert_eq!(options.dtype, DataType::Float32);
        assert_eq!(options.initializer.kind, InitializerKind::Uniform);
        assert!(options.learning_rate_schedule.warmup.is_none());
        assert_eq!(options.runtime.num_shards, 64);
    }
}
