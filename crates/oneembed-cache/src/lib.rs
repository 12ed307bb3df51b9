//! Embedding records and the in-memory cache tiers.
//!
//! # Overview
//!
//! The main components are:
//!
//! - [`EmbeddingRecord`] - One row: vector, optimizer state, access generation, dirty flag
//! - [`RecordLayout`] - The fixed-width byte encoding records use on disk
//! - [`CacheTier`] - The interface shared by L1 and L2
//! - [`LruTier`] - A least-recently-used tier bounded by a memory budget
//! - [`SharedBudget`] - One record budget charged by several striped tiers
//! - [`DisabledTier`] - The "none" policy, which holds nothing
//! - [`KeyInitializer`] - Per-key deterministic initial vectors
//!
//! # Example
//!
//! ```
//! use oneembed_cache::{CacheTier, EmbeddingRecord, LruTier};
//! use oneembed_core::{Key, TierKind};
//! use oneembed_optimizer::OptimizerState;
//!
//! let mut l1 = LruTier::new(TierKind::L1, 1);
//! l1.put(EmbeddingRecord::new(Key::from_id(1), vec![0.1, 0.2], OptimizerState::None));
//!
//! let evicted = l1.put(EmbeddingRecord::new(Key::from_id(2), vec![0.3, 0.4], OptimizerState::None));
//! assert_eq!(evicted.unwrap().key, Key::from_id(1));
//! ```

pub mod initializer;
mod lru;
mod record;
mod tier;

pub use initializer::{
    ConstantInitializer, Initializer, KeyInitializer, RandomNormalInitializer,
    RandomUniformInitializer, ZerosInitializer,
};
pub use lru::{capacity_for_budget, LruTier, SharedBudget};
pub use record::{EmbeddingRecord, RecordLayout, HEADER_BYTES};
pub use tier::{CacheTier, DisabledTier};

use std::sync::Arc;

use oneembed_core::{CacheOptions, Result, TierKind};

/// Builds the tier described by `options`, split into `stripes` parts.
///
/// Returns one tier per stripe. Every stripe keeps its own LRU order and
/// charges one [`SharedBudget`], so the record limit holds for the tier as a
/// whole.
///
/// # Errors
///
/// Returns [`oneembed_core::EmbeddingError::Capacity`] if the budget holds no
/// record at all.
pub fn build_striped_tiers(
    tier: TierKind,
    options: &CacheOptions,
    record_bytes: u64,
    stripes: usize,
) -> Result<Vec<Box<dyn CacheTier>>> {
    if !options.is_enabled() {
        return Ok((0..stripes)
            .map(|_| Box::new(DisabledTier::new(tier)) as Box<dyn CacheTier>)
            .collect());
    }
    let budget = SharedBudget::new(capacity_for_budget(
        tier,
        options.budget_bytes(),
        record_bytes,
    )?);
    Ok((0..stripes.max(1))
        .map(|_| Box::new(LruTier::sharing(tier, Arc::clone(&budget))) as Box<dyn CacheTier>)
        .collect())
}
