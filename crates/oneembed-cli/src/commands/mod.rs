//! CLI Command Implementations
//!
//! - [`validate`]: options blob validation
//! - [`inspect`]: fixed table inspection
//! - [`bench`]: synthetic throughput runs

mod bench;
mod inspect;
mod validate;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use oneembed_core::{EmbeddingOptions, OptimizerKind};

pub use bench::{BenchCommand, BenchReport};
pub use inspect::InspectCommand;
pub use validate::ValidateCommand;

/// Flags that override fields of an options blob.
///
/// Each flag falls back to the environment variable that used to toggle the
/// same setting process-wide.
#[derive(Args, Debug, Clone, Default)]
pub struct OptionOverrides {
    /// Width of every embedding vector
    #[arg(long, env = "EMBEDDING_SIZE")]
    pub embedding_size: Option<usize>,

    /// Directory holding the fixed table
    #[arg(long, env = "BLOCK_BASED_PATH")]
    pub fixed_table_path: Option<PathBuf>,

    /// Fixed table block size in bytes
    #[arg(long, env = "FIXED_TABLE_BLOCK_SIZE")]
    pub block_size: Option<u64>,

    /// Optimizer type (sgd, momentum, adam, adagrad)
    #[arg(long, env = "OPTIMIZER")]
    pub optimizer: Option<String>,
}

impl OptionOverrides {
    /// Writes every set flag into `options`.
    pub fn apply(&self, options: &mut EmbeddingOptions) -> Result<()> {
        if let Some(size) = self.embedding_size {
            options.embedding_size = size;
        }
        if let Some(path) = &self.fixed_table_path {
            options.fixed_table.path = Some(path.clone());
        }
        if let Some(block_size) = self.block_size {
            options.fixed_table.block_size = block_size;
        }
        if let Some(optimizer) = &self.optimizer {
            options.optimizer.kind = parse_optimizer(optimizer)?;
        }
        Ok(())
    }
}

fn parse_optimizer(name: &str) -> Result<OptimizerKind> {
    serde_json::from_value(serde_json::Value::String(name.to_ascii_lowercase()))
        .with_context(|| format!("Unknown optimizer type: {name}"))
}

/// Reads an options blob, applies `overrides` and validates the result.
pub fn load_options(path: &Path, overrides: &OptionOverrides) -> Result<EmbeddingOptions> {
    let blob = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read options from {}", path.display()))?;
    let mut options: EmbeddingOptions = serde_json::from_str(&blob)
        .with_context(|| format!("Malformed options blob in {}", path.display()))?;
    overrides.apply(&mut options)?;
    options.validate().context("Invalid embedding options")?;
    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_optimizer() {
        assert_eq!(parse_optimizer("adam").unwrap(), OptimizerKind::Adam);
        assert_eq!(parse_optimizer("Adagrad").unwrap(), OptimizerKind::Adagrad);
        assert!(parse_optimizer("rmsprop").is_err());
    }

    #[test]
    fn test_overrides_replace_fields() {
        let mut options = EmbeddingOptions::new("t", 16, "/tmp/a");
        let overrides = OptionOverrides {
            embedding_size: Some(32),
            fixed_table_path: Some(PathBuf::from("/tmp/b")),
            block_size: Some(1024),
            optimizer: Some("momentum".to_string()),
        };
        overrides.apply(&mut options).unwrap();

        assert_eq!(options.embedding_size, 32);
        assert_eq!(options.fixed_table.path, Some(PathBuf::from("/tmp/b")));
        assert_eq!(options.fixed_table.block_size, 1024);
        assert_eq!(options.optimizer.kind, OptimizerKind::Momentum);
        options.validate().unwrap();
    }
}
