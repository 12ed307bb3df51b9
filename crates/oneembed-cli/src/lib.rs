//! oneembed CLI Library
//!
//! Command-line tools around the tiered embedding engine:
//!
//! - **Validate**: parse an options blob and report the resulting capacities
//! - **Inspect**: print the metadata and rows of an existing fixed table
//! - **Bench**: drive synthetic lookup/update batches and report throughput
//!
//! # Example
//!
//! ```bash
//! # Check an options blob
//! oneembed validate options.json
//!
//! # Look at a table on disk
//! oneembed inspect /data/user_table --key 42
//!
//! # Run 200 batches of 4096 ids
//! oneembed bench --batches 200 --batch-size 4096
//! ```

pub mod commands;

use clap::{Parser, Subcommand};

pub use commands::{BenchCommand, InspectCommand, OptionOverrides, ValidateCommand};

/// oneembed - a tiered embedding table with online optimizer updates
#[derive(Parser, Debug)]
#[command(name = "oneembed")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// The subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate an options blob and print the cache capacities it yields
    Validate(ValidateCommand),

    /// Print the metadata and selected rows of a fixed table
    Inspect(InspectCommand),

    /// Run synthetic lookup/update batches against a table
    Bench(BenchCommand),
}

/// Result type alias for CLI operations
pub type CliResult<T> = anyhow::Result<T>;
