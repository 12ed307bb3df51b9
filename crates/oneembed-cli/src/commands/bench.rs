//! Bench Command Implementation

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Args;
use oneembed_core::{CacheOptions, EmbeddingOptions, FeatureId};
use oneembed_engine::{EmbeddingEngine, StatsSnapshot};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use super::{load_options, OptionOverrides};

/// Run synthetic lookup/update batches
///
/// Each batch looks up `batch_size` ids drawn uniformly from `key_space`
/// and feeds a random gradient back for the rows it got.
///
/// # Example
///
/// ```bash
/// oneembed bench --options options.json --batches 200 --batch-size 4096
/// ```
#[derive(Args, Debug, Clone)]
pub struct BenchCommand {
    /// Options blob to start from; a small stock table otherwise
    #[arg(long)]
    pub options: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: OptionOverrides,

    /// Table directory; a temporary one is used if neither this nor the
    /// options blob names one
    #[arg(long)]
    pub dir: Option<PathBuf>,

    /// Number of lookup/update rounds
    #[arg(long, default_value = "100")]
    pub batches: usize,

    /// Ids per batch
    #[arg(long, default_value = "1024")]
    pub batch_size: usize,

    /// Ids are drawn from [0, key_space)
    #[arg(long, default_value = "100000")]
    pub key_space: FeatureId,

    /// Seed for ids and gradients
    #[arg(long, default_value = "0")]
    pub seed: u64,
}

/// Outcome of a bench run.
#[derive(Debug, Clone)]
pub struct BenchReport {
    pub batches: usize,
    pub lookup_time: Duration,
    pub update_time: Duration,
    pub flushed: usize,
    pub global_step: u64,
    pub stats: StatsSnapshot,
}

impl BenchReport {
    /// Ids looked up per second.
    pub fn lookup_rate(&self) -> f64 {
        rate(self.stats.keys_looked_up, self.lookup_time)
    }

    /// Keys updated per second.
    pub fn update_rate(&self) -> f64 {
        rate(self.stats.keys_updated, self.update_time)
    }
}

fn rate(keys: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs == 0.0 {
        0.0
    } else {
        keys as f64 / secs
    }
}

impl std::fmt::Display for BenchReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "batches: {}", self.batches)?;
        writeln!(
            f,
            "lookup: {:?} ({:.0} keys/s)",
            self.lookup_time,
            self.lookup_rate()
        )?;
        writeln!(
            f,
            "update: {:?} ({:.0} keys/s)",
            self.update_time,
            self.update_rate()
        )?;
        writeln!(f, "l1 hit rate: {:.3}", self.stats.l1_hit_rate())?;
        writeln!(f, "flushed: {}", self.flushed)?;
        writeln!(f, "global_step: {}", self.global_step)?;
        writeln!(f, "{}", self.stats)
    }
}

impl BenchCommand {
    /// Execute the bench command
    pub fn run(&self) -> Result<()> {
        let mut options = match &self.options {
            Some(path) => load_options(path, &self.overrides)?,
            None => self.stock_options()?,
        };
        if let Some(dir) = &self.dir {
            options.fixed_table.path = Some(dir.clone());
        }

        // Keeps the temporary table alive until the report is printed.
        let _scratch = if options.fixed_table.path.is_none() {
            let scratch = tempfile::TempDir::new().context("Failed to create a scratch table")?;
            options.fixed_table.path = Some(scratch.path().to_path_buf());
            Some(scratch)
        } else {
            None
        };

        let report = self.execute(options)?;
        print!("{report}");
        Ok(())
    }

    fn stock_options(&self) -> Result<EmbeddingOptions> {
        let mut options = EmbeddingOptions::new("bench", 16, PathBuf::new());
        options.fixed_table.path = None;
        options.l1_cache = CacheOptions::lru(64);
        self.overrides.apply(&mut options)?;
        Ok(options)
    }

    /// Opens the engine described by `options` and drives it.
    pub fn execute(&self, options: EmbeddingOptions) -> Result<BenchReport> {
        anyhow::ensure!(self.key_space > 0, "--key-space must be positive");

        let engine = EmbeddingEngine::open(options).context("Failed to open the engine")?;
        info!(
            embedding = engine.name(),
            l1_capacity = engine.l1_capacity(),
            l2_capacity = engine.l2_capacity(),
            "Starting bench"
        );

        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut ids: Vec<FeatureId> = Vec::with_capacity(self.batch_size);
        let mut lookup_time = Duration::ZERO;
        let mut update_time = Duration::ZERO;

        for batch in 0..self.batches {
            ids.clear();
            ids.extend((0..self.batch_size).map(|_| rng.gen_range(0..self.key_space)));

            let started = Instant::now();
            let rows = engine.lookup(&ids)?;
            lookup_time += started.elapsed();

            let gradients: Vec<f32> = (0..rows.values().len())
                .map(|_| rng.gen_range(-0.01f32..0.01))
                .collect();
            let started = Instant::now();
            engine.apply_gradient_checked(&rows, &gradients)?;
            update_time += started.elapsed();

            if (batch + 1) % 10 == 0 {
                debug!(batch = batch + 1, "Bench progress");
            }
        }

        let flushed = engine.flush()?;
        let report = BenchReport {
            batches: self.batches,
            lookup_time,
            update_time,
            flushed,
            global_step: engine.global_step(),
            stats: engine.stats(),
        };
        engine.close()?;
        Ok(report)
    }
}
