//! Engine counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters updated by concurrent batches.
#[derive(Debug, Default)]
pub(crate) struct EngineStats {
    pub lookups: AtomicU64,
    pub updates: AtomicU64,
    pub keys_looked_up: AtomicU64,
    pub keys_updated: AtomicU64,
    pub l1_hits: AtomicU64,
    pub l2_hits: AtomicU64,
    pub fixed_hits: AtomicU64,
    pub initializations: AtomicU64,
    pub evictions: AtomicU64,
    pub rows_written: AtomicU64,
    pub consistency_repairs: AtomicU64,
    pub failed_batches: AtomicU64,
}

impl EngineStats {
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn incr(counter: &AtomicU64) {
        Self::add(counter, 1);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            lookups: load(&self.lookups),
            updates: load(&self.updates),
            keys_looked_up: load(&self.keys_looked_up),
            keys_updated: load(&self.keys_updated),
            l1_hits: load(&self.l1_hits),
            l2_hits: load(&self.l2_hits),
            fixed_hits: load(&self.fixed_hits),
            initializations: load(&self.initializations),
            evictions: load(&self.evictions),
            rows_written: load(&self.rows_written),
            consistency_repairs: load(&self.consistency_repairs),
            failed_batches: load(&self.failed_batches),
        }
    }
}

/// A point-in-time copy of the engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Lookup batches served.
    pub lookups: u64,
    /// Update batches applied.
    pub updates: u64,
    /// Unique keys resolved by lookups.
    pub keys_looked_up: u64,
    /// Unique keys stepped by updates.
    pub keys_updated: u64,
    /// Keys found resident in L1.
    pub l1_hits: u64,
    /// Keys found resident in L2.
    pub l2_hits: u64,
    /// Keys loaded from the fixed table.
    pub fixed_hits: u64,
    /// Keys seen for the first time.
    pub initializations: u64,
    /// Records evicted from L1 or L2.
    pub evictions: u64,
    /// Records written to the fixed table.
    pub rows_written: u64,
    /// Keys whose tier state was invalidated and reloaded.
    pub consistency_repairs: u64,
    /// Batches that returned an error.
    pub failed_batches: u64,
}

impl StatsSnapshot {
    /// Fraction of resolved keys served from L1.
    pub fn l1_hit_rate(&self) -> f64 {
        let resolved = self.l1_hits + self.l2_hits + self.fixed_hits + self.initializations;
        if resolved == 0 {
            0.0
        } else {
            self.l1_hits as f64 / resolved as f64
        }
    }
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "lookups={} updates={} l1_hits={} l2_hits={} fixed_hits={} initializations={} \
             evictions={} rows_written={} consistency_repairs={} failed_batches={}",
            self.lookups,
            self.updates,
            self.l1_hits,
            self.l2_hits,
            self.fixed_hits,
            self.initializations,
            self.evictions,
            self.rows_written,
            self.consistency_repairs,
            self.failed_batches
        )
    }
}
