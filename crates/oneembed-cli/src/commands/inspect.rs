//! Inspect Command Implementation

use std::fmt::Write as _;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use oneembed_core::{FeatureId, Key};
use oneembed_storage::FixedTable;

/// Print the metadata and selected rows of a fixed table
///
/// # Example
///
/// ```bash
/// oneembed inspect /data/user_table --key 42 --key -7
/// ```
#[derive(Args, Debug, Clone)]
pub struct InspectCommand {
    /// Directory of an existing fixed table
    pub table_dir: PathBuf,

    /// Feature ids whose stored rows should be printed
    #[arg(long = "key", allow_hyphen_values = true)]
    pub keys: Vec<FeatureId>,

    /// Number of leading values to print per row
    #[arg(long, default_value = "8")]
    pub max_values: usize,
}

impl InspectCommand {
    /// Execute the inspect command
    pub fn run(&self) -> Result<()> {
        print!("{}", self.describe()?);
        Ok(())
    }

    /// Renders the table metadata and the requested rows.
    pub fn describe(&self) -> Result<String> {
        let table = FixedTable::open_existing(&self.table_dir)
            .with_context(|| format!("Failed to open table in {}", self.table_dir.display()))?;
        let meta = table.meta();

        let mut out = String::new();
        writeln!(out, "embedding_name: {}", meta.embedding_name)?;
        writeln!(out, "embedding_size: {}", meta.embedding_size)?;
        writeln!(out, "optimizer: {}", meta.optimizer.name())?;
        writeln!(out, "record_bytes: {}", meta.record_bytes)?;
        writeln!(
            out,
            "block_size: {}, chunk_size: {}",
            meta.block_size, meta.chunk_size
        )?;
        writeln!(out, "rows: {}", table.len())?;
        writeln!(out, "last_step: {}", meta.last_step)?;

        for &id in &self.keys {
            let record = table
                .get(Key::from_id(id))
                .with_context(|| format!("Failed to read key {id}"))?;
            match record {
                Some(record) => {
                    let shown = &record.embedding[..record.embedding.len().min(self.max_values)];
                    let more = if shown.len() < record.embedding.len() {
                        " ..."
                    } else {
                        ""
                    };
                    writeln!(
                        out,
                        "key {id}: version {}, step {}, values {shown:?}{more}",
                        record.version,
                        record.state.step()
                    )?;
                }
                None => writeln!(out, "key {id}: not stored")?,
            }
        }
        Ok(out)
    }
}
