//! Least-recently-used cache tier.
//!
//! Every access stamps the record with the tier's next access generation.
//! An ordered index over `(generation, key)` yields the eviction victim in
//! `O(log n)` without scanning.
//!
//! Several tiers can charge one [`SharedBudget`]. The engine uses that to
//! split a tier into lock stripes that each keep their own LRU order while
//! the record budget stays global.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use oneembed_core::{EmbeddingError, Key, Result, TierKind};

use crate::record::EmbeddingRecord;
use crate::tier::CacheTier;

/// Returns how many records of `record_bytes` fit in `budget_bytes`.
///
/// # Errors
///
/// Returns [`EmbeddingError::Capacity`] if not even one record fits.
pub fn capacity_for_budget(tier: TierKind, budget_bytes: u64, record_bytes: u64) -> Result<usize> {
    let records = budget_bytes.checked_div(record_bytes).unwrap_or(0);
    if records == 0 {
        return Err(EmbeddingError::Capacity {
            tier,
            budget_bytes,
            record_bytes,
        });
    }
    Ok(usize::try_from(records).unwrap_or(usize::MAX))
}

/// A record count charged by every tier that shares it.
#[derive(Debug)]
pub struct SharedBudget {
    capacity: usize,
    resident: AtomicUsize,
}

impl SharedBudget {
    /// Creates an empty budget of `capacity` records.
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            resident: AtomicUsize::new(0),
        })
    }

    /// Maximum number of records across all sharing tiers.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Records currently charged.
    pub fn resident(&self) -> usize {
        self.resident.load(Ordering::Acquire)
    }

    /// Returns `true` once the charged records reach capacity.
    pub fn is_full(&self) -> bool {
        self.resident() >= self.capacity
    }

    fn charge(&self) {
        self.resident.fetch_add(1, Ordering::AcqRel);
    }

    fn release(&self) {
        let _ = self
            .resident
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

/// A record-count bounded LRU tier.
#[derive(Debug)]
pub struct LruTier {
    tier: TierKind,
    budget: Arc<SharedBudget>,
    records: HashMap<Key, EmbeddingRecord>,
    order: BTreeSet<(u64, Key)>,
    clock: u64,
}

impl LruTier {
    /// Creates a tier holding at most `capacity` records.
    pub fn new(tier: TierKind, capacity: usize) -> Self {
        Self::sharing(tier, SharedBudget::new(capacity))
    }

    /// Creates a tier that charges its records to `budget`.
    ///
    /// Inserting into a full budget evicts from this tier's own LRU order.
    /// If this tier holds nothing, the insert goes over budget and the caller
    /// is expected to evict from a sibling.
    pub fn sharing(tier: TierKind, budget: Arc<SharedBudget>) -> Self {
        Self {
            tier,
            budget,
            records: HashMap::new(),
            order: BTreeSet::new(),
            clock: 0,
        }
    }

    /// Creates a tier sized from a memory budget.
    pub fn with_budget(tier: TierKind, budget_bytes: u64, record_bytes: u64) -> Result<Self> {
        let capacity = capacity_for_budget(tier, budget_bytes, record_bytes)?;
        Ok(Self::new(tier, capacity))
    }

    /// The budget this tier charges.
    pub fn budget(&self) -> &Arc<SharedBudget> {
        &self.budget
    }

    fn next_generation(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Inserts without touching the budget. Returns the replaced record.
    fn insert(&mut self, record: EmbeddingRecord) -> Option<EmbeddingRecord> {
        let key = record.key;
        let previous = self.records.remove(&key);
        if let Some(previous) = &previous {
            self.order.remove(&(previous.generation, key));
        }
        self.order.insert((record.generation, key));
        self.records.insert(key, record);
        previous
    }
}

impl CacheTier for LruTier {
    fn tier(&self) -> TierKind {
        self.tier
    }

    fn capacity(&self) -> usize {
        self.budget.capacity()
    }

    fn len(&self) -> usize {
        self.records.len()
    }

    fn resident(&self) -> usize {
        self.budget.resident()
    }

    fn contains(&self, key: Key) -> bool {
        self.records.contains_key(&key)
    }

    fn get(&mut self, key: Key) -> Option<&EmbeddingRecord> {
        let generation = self.next_generation();
        let record = self.records.get_mut(&key)?;
        self.order.remove(&(record.generation, key));
        record.generation = generation;
        self.order.insert((generation, key));
        Some(record)
    }

    fn peek(&self, key: Key) -> Option<&EmbeddingRecord> {
        self.records.get(&key)
    }

    fn take(&mut self, key: Key) -> Option<EmbeddingRecord> {
        let record = self.records.remove(&key)?;
        self.order.remove(&(record.generation, key));
        self.budget.release();
        Some(record)
    }

    fn put(&mut self, mut record: EmbeddingRecord) -> Option<EmbeddingRecord> {
        let evicted = if self.records.contains_key(&record.key) || !self.budget.is_full() {
            None
        } else {
            self.pop_lru()
        };

        record.generation = self.next_generation();
        if self.insert(record).is_none() {
            self.budget.charge();
        }
        evicted
    }

    fn evict_if_needed(&mut self) -> Option<EmbeddingRecord> {
        if self.budget.is_full() {
            self.pop_lru()
        } else {
            None
        }
    }

    fn pop_lru(&mut self) -> Option<EmbeddingRecord> {
        let (_, key) = self.order.pop_first()?;
        let victim = self.records.remove(&key)?;
        self.budget.release();
        tracing::debug!(
            tier = %self.tier,
            key = %victim.key,
            dirty = victim.dirty,
            generation = victim.generation,
            "Evicting least recently used record"
        );
        Some(victim)
    }

    fn restore(&mut self, record: EmbeddingRecord) -> Option<EmbeddingRecord> {
        if self.insert(record).is_none() {
            self.budget.charge();
        }
        None
    }

    fn dirty_keys(&self) -> Vec<Key> {
        self.records
            .values()
            .filter(|r| r.dirty)
            .map(|r| r.key)
            .collect()
    }

    fn mark_clean(&mut self, key: Key) {
        if let Some(record) = self.records.get_mut(&key) {
            record.dirty = false;
        }
    }
}
