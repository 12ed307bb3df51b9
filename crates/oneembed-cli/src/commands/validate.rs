//! Validate Command Implementation

use std::fmt::Write as _;
use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use oneembed_cache::{capacity_for_budget, RecordLayout};
use oneembed_core::{CacheOptions, EmbeddingOptions, TierKind};
use tracing::info;

use super::{load_options, OptionOverrides};

/// Validate an options blob
///
/// Parses the blob, applies any overrides and prints the record sizes and
/// cache capacities the engine would use.
///
/// # Example
///
/// ```bash
/// EMBEDDING_SIZE=64 oneembed validate options.json
/// ```
#[derive(Args, Debug, Clone)]
pub struct ValidateCommand {
    /// Path to the JSON options blob
    pub options: PathBuf,

    #[command(flatten)]
    pub overrides: OptionOverrides,
}

impl ValidateCommand {
    /// Execute the validate command
    pub fn run(&self) -> Result<()> {
        let options = load_options(&self.options, &self.overrides)?;
        let report = describe(&options)?;
        info!(embedding = %options.embedding_name, "Options are valid");
        print!("{report}");
        Ok(())
    }
}

/// Renders the sizes and capacities implied by `options`.
pub fn describe(options: &EmbeddingOptions) -> Result<String> {
    let layout = RecordLayout::new(options.embedding_size, options.optimizer.kind);
    let mut out = String::new();
    writeln!(out, "embedding_name: {}", options.embedding_name)?;
    writeln!(out, "embedding_size: {}", options.embedding_size)?;
    writeln!(out, "optimizer: {}", options.optimizer.kind.name())?;
    writeln!(
        out,
        "record: {} bytes in memory, {} bytes on disk",
        layout.footprint(),
        layout.encoded_len()
    )?;
    describe_cache(&mut out, TierKind::L1, &options.l1_cache, layout)?;
    describe_cache(&mut out, TierKind::L2, &options.l2_cache, layout)?;

    let table = &options.fixed_table;
    let path = table
        .path
        .as_deref()
        .map_or_else(|| "<unset>".to_string(), |p| p.display().to_string());
    writeln!(
        out,
        "fixed_table: {path}, block {} bytes, chunk {} bytes ({} blocks)",
        table.block_size,
        table.chunk_size,
        table.blocks_per_chunk()
    )?;
    let record_len = layout.encoded_len() as u64;
    if record_len <= table.block_size {
        writeln!(out, "  {} records per block", table.block_size / record_len)?;
    } else {
        writeln!(
            out,
            "  {} blocks per record",
            record_len.div_ceil(table.block_size)
        )?;
    }
    Ok(out)
}

fn describe_cache(
    out: &mut String,
    tier: TierKind,
    cache: &CacheOptions,
    layout: RecordLayout,
) -> Result<()> {
    if !cache.is_enabled() {
        writeln!(out, "{tier}: none")?;
        return Ok(());
    }
    let capacity = capacity_for_budget(tier, cache.budget_bytes(), layout.footprint())?;
    writeln!(
        out,
        "{tier}: lru, {} MiB, {capacity} records",
        cache.cache_memory_budget_mb.unwrap_or(0)
    )?;
    Ok(())
}
