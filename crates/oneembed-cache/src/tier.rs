//! The in-memory cache tier interface.

use oneembed_core::{Key, TierKind};

use crate::record::EmbeddingRecord;

/// A bounded in-memory tier holding [`EmbeddingRecord`]s by key.
///
/// Tiers are not internally synchronized; the engine serializes access per
/// lock stripe.
pub trait CacheTier: Send {
    /// Which level this tier is.
    fn tier(&self) -> TierKind;

    /// Returns `false` for the pass-through "none" policy.
    fn is_enabled(&self) -> bool {
        true
    }

    /// Maximum number of resident records, across every tier sharing this
    /// tier's budget.
    fn capacity(&self) -> usize;

    /// Number of records resident in this tier.
    fn len(&self) -> usize;

    /// Number of records charged to this tier's budget.
    fn resident(&self) -> usize {
        self.len()
    }

    /// Returns `true` if no records are resident.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if the key is resident.
    fn contains(&self, key: Key) -> bool;

    /// Returns the record for `key` and marks it most recently used.
    fn get(&mut self, key: Key) -> Option<&EmbeddingRecord>;

    /// Returns the record for `key` without touching its access generation.
    fn peek(&self, key: Key) -> Option<&EmbeddingRecord>;

    /// Removes and returns the record for `key`.
    fn take(&mut self, key: Key) -> Option<EmbeddingRecord>;

    /// Inserts `record` as most recently used.
    ///
    /// Replaces any resident record with the same key. If the budget is full,
    /// exactly one least-recently-used record is evicted first and returned;
    /// the caller owns it and must flush it if dirty.
    fn put(&mut self, record: EmbeddingRecord) -> Option<EmbeddingRecord>;

    /// Pops the least-recently-used record if the budget is at or over capacity.
    fn evict_if_needed(&mut self) -> Option<EmbeddingRecord>;

    /// Pops the least-recently-used record regardless of occupancy.
    fn pop_lru(&mut self) -> Option<EmbeddingRecord>;

    /// Reinserts a record taken from this tier, keeping its access generation.
    ///
    /// Used to undo a move that failed part way. The capacity check is skipped,
    /// so the tier may sit over budget until its next eviction.
    /// Returns the record back if this tier cannot hold records at all.
    fn restore(&mut self, record: EmbeddingRecord) -> Option<EmbeddingRecord>;

    /// Keys of resident records with unflushed updates.
    fn dirty_keys(&self) -> Vec<Key>;

    /// Clears the dirty flag of a resident record.
    fn mark_clean(&mut self, key: Key);
}

/// The "none" policy: holds nothing and hands every insert straight back.
#[derive(Debug, Clone, Copy)]
pub struct DisabledTier {
    tier: TierKind,
}

impl DisabledTier {
    pub fn new(tier: TierKind) -> Self {
        Self { tier }
    }
}

impl CacheTier for DisabledTier {
    fn tier(&self) -> TierKind {
        self.tier
    }

    fn is_enabled(&self) -> bool {
        false
    }

    fn capacity(&self) -> usize {
        0
    }

    fn len(&self) -> usize {
        0
    }

    fn contains(&self, _key: Key) -> bool {
        false
    }

    fn get(&mut self, _key: Key) -> Option<&EmbeddingRecord> {
        None
    }

    fn peek(&self, _key: Key) -> Option<&EmbeddingRecord> {
        None
    }

    fn take(&mut self, _key: Key) -> Option<EmbeddingRecord> {
        None
    }

    fn put(&mut self, record: EmbeddingRecord) -> Option<EmbeddingRecord> {
        Some(record)
    }

    fn evict_if_needed(&mut self) -> Option<EmbeddingRecord> {
        None
    }

    fn pop_lru(&mut self) -> Option<EmbeddingRecord> {
        None
    }

    fn restore(&mut self, record: EmbeddingRecord) -> Option<EmbeddingRecord> {
        Some(record)
    }

    fn dirty_keys(&self) -> Vec<Key> {
        Vec::new()
    }

    fn mark_clean(&mut self, _key: Key) {}
}
