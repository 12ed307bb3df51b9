//! The lookup/update coordinator.
//!
//! Keys are spread over lock stripes by [`Key::bucket`]. Each stripe owns one
//! slice of L1 and one slice of L2, so a batch locks the stripes its keys fall
//! in (always in ascending order) and holds them until it returns. That gives
//! per-key mutual exclusion while batches touching disjoint stripes run
//! concurrently.
//!
//! Stripes split locking only. Each tier's record budget is shared by all of
//! its stripes, and eviction starts once the tier as a whole is full.
//!
//! A batch runs in four phases:
//!
//! 1. take every key out of L1/L2 into a private working set
//! 2. read the remaining keys from the fixed table on the worker pool, waiting
//!    at most `runtime.io_timeout_ms`, and initialize the rest
//! 3. evict enough L1 records to seat the working set, demoting them to L2 or
//!    the fixed table
//! 4. read or update the working set and put it back into L1
//!
//! Phases 1-3 are the only ones that can fail. A failure puts every taken
//! record back where it came from, so a failed batch leaves no partial
//! effect behind.

use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use oneembed_cache::{
    build_striped_tiers, CacheTier, EmbeddingRecord, Initializer, KeyInitializer, RecordLayout,
};
use oneembed_core::{
    DataType, EmbeddingError, EmbeddingOptions, FeatureId, Key, Result, TierKind,
};
use oneembed_optimizer::{
    LearningRateFunction, LearningRateSchedule, Optimizer, ScheduleState, UpdateRule,
};
use oneembed_storage::{BlockDevice, FixedTable};
use parking_lot::{Mutex, MutexGuard};
use rayon::prelude::*;

use crate::output::{Embeddings, TypedEmbeddings};
use crate::stats::{EngineStats, StatsSnapshot};

struct Stripe {
    l1: Box<dyn CacheTier>,
    l2: Box<dyn CacheTier>,
}

impl Stripe {
    fn tier_mut(&mut self, tier: TierKind) -> &mut dyn CacheTier {
        match tier {
            TierKind::L2 => self.l2.as_mut(),
            _ => self.l1.as_mut(),
        }
    }

    /// Puts a record back into `tier`, falling back to L1.
    fn restore(&mut self, tier: TierKind, record: EmbeddingRecord) {
        if let Some(record) = self.tier_mut(tier).restore(record) {
            self.l1.restore(record);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    L1,
    L2,
    Fixed,
    Initialized,
}

struct Working {
    record: EmbeddingRecord,
    origin: Origin,
}

enum Resident {
    Found(Working),
    Missing,
    Diverged,
}

struct Deadline {
    started: Instant,
    limit: Duration,
}

impl Deadline {
    fn start(limit: Duration) -> Self {
        Self {
            started: Instant::now(),
            limit,
        }
    }

    fn check(&self) -> Result<()> {
        if self.started.elapsed() > self.limit {
            return Err(self.expired());
        }
        Ok(())
    }

    fn remaining(&self) -> Duration {
        self.limit.saturating_sub(self.started.elapsed())
    }

    fn expired(&self) -> EmbeddingError {
        EmbeddingError::Timeout {
            elapsed: self.started.elapsed(),
            limit: self.limit,
        }
    }
}

/// Unique keys of a batch, in first-occurrence order.
struct BatchKeys {
    unique: Vec<Key>,
    /// For each input row, its index into `unique`.
    slots: Vec<usize>,
}

impl BatchKeys {
    fn new(keys: impl IntoIterator<Item = Key>) -> Self {
        let mut index: HashMap<Key, usize> = HashMap::new();
        let mut unique = Vec::new();
        let slots = keys
            .into_iter()
            .map(|key| {
                *index.entry(key).or_insert_with(|| {
                    unique.push(key);
                    unique.len() - 1
                })
            })
            .collect();
        Self { unique, slots }
    }

    /// Sums the rows of duplicate keys.
    fn sum_rows(&self, rows: &[f32], dim: usize) -> Vec<f32> {
        let mut summed = vec![0.0f32; self.unique.len() * dim];
        for (row, &slot) in rows.chunks_exact(dim).zip(&self.slots) {
            let start = slot * dim;
            for (acc, value) in summed[start..start + dim].iter_mut().zip(row) {
                *acc += value;
            }
        }
        summed
    }

    /// Picks the value of each key's first row.
    fn first_of_each(&self, values: &[u64]) -> Vec<u64> {
        let mut picked: Vec<Option<u64>> = vec![None; self.unique.len()];
        for (&slot, &value) in self.slots.iter().zip(values) {
            picked[slot].get_or_insert(value);
        }
        picked.into_iter().map(Option::unwrap_or_default).collect()
    }
}

struct LockedStripe<'a> {
    guard: MutexGuard<'a, Stripe>,
    /// Indices into the batch's unique keys.
    members: Vec<usize>,
}

/// Records taken out of a tier during a batch.
///
/// Dropped on success; put back into their tiers on failure.
#[derive(Default)]
struct Undo {
    discarded: Vec<(usize, TierKind, EmbeddingRecord)>,
}

/// A tiered embedding table with online per-key optimizer updates.
///
/// # Example
///
/// ```no_run
/// use oneembed_core::EmbeddingOptions;
/// use oneembed_engine::EmbeddingEngine;
///
/// fn main() -> oneembed_core::Result<()> {
///     let engine = EmbeddingEngine::open(EmbeddingOptions::new("user", 4, "/tmp/user_table"))?;
///
///     let rows = engine.lookup(&[7, 42, 7])?;
///     assert_eq!(rows.len(), 3);
///
///     engine.apply_gradient(&[7, 42, 7], &[0.1; 12])?;
///     engine.close()
/// }
/// ```
pub struct EmbeddingEngine {
    options: EmbeddingOptions,
    layout: RecordLayout,
    initializer: KeyInitializer,
    optimizer: Optimizer,
    schedule: LearningRateSchedule,
    schedule_state: ScheduleState,
    stripes: Vec<Mutex<Stripe>>,
    table: Arc<FixedTable>,
    pool: rayon::ThreadPool,
    stats: EngineStats,
    io_timeout: Duration,
    closed: AtomicBool,
}

impl std::fmt::Debug for EmbeddingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingEngine")
            .field("embedding", &self.options.embedding_name)
            .field("layout", &self.layout)
            .field("stripes", &self.stripes.len())
            .field("table", &self.table)
            .field("step", &self.schedule_state.current())
            .finish()
    }
}

impl EmbeddingEngine {
    /// Parses an options blob and opens the engine it describes.
    pub fn from_json(blob: &str) -> Result<Self> {
        Self::open(EmbeddingOptions::from_json(blob)?)
    }

    /// Opens the engine on chunk files under `fixed_table.path`.
    ///
    /// # Errors
    ///
    /// Returns [`EmbeddingError::Configuration`] for invalid options or an
    /// incompatible existing table, and [`EmbeddingError::Capacity`] when a
    /// cache budget cannot hold one record.
    pub fn open(options: EmbeddingOptions) -> Result<Self> {
        options.validate()?;
        let layout = RecordLayout::new(options.embedding_size, options.optimizer.kind);
        let stripes = build_stripes(&options, layout)?;
        let table = FixedTable::open(&options.embedding_name, &options.fixed_table, layout)?;
        Self::assemble(options, layout, stripes, table)
    }

    /// Opens the engine on an explicit block device.
    ///
    /// Table metadata is still kept under `fixed_table.path`.
    pub fn open_with_device(options: EmbeddingOptions, device: Box<dyn BlockDevice>) -> Result<Self> {
        options.validate()?;
        let layout = RecordLayout::new(options.embedding_size, options.optimizer.kind);
        let stripes = build_stripes(&options, layout)?;
        let table = FixedTable::open_with_device(
            &options.embedding_name,
            &options.fixed_table,
            layout,
            device,
        )?;
        Self::assemble(options, layout, stripes, table)
    }

    fn assemble(
        options: EmbeddingOptions,
        layout: RecordLayout,
        stripes: Vec<Mutex<Stripe>>,
        table: FixedTable,
    ) -> Result<Self> {
        let initializer = KeyInitializer::from_options(&options.initializer)?;
        let optimizer = Optimizer::from_options(&options.optimizer);
        let schedule = LearningRateSchedule::from_options(&options.learning_rate_schedule);
        let schedule_state = ScheduleState::starting_at(table.last_step());

        let name = options.embedding_name.clone();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.runtime.num_workers)
            .thread_name(move |i| format!("oneembed-{name}-{i}"))
            .build()
            .map_err(|e| EmbeddingError::config(format!("cannot start worker pool: {e}")))?;

        let engine = Self {
            io_timeout: options.runtime.io_timeout(),
            options,
            layout,
            initializer,
            optimizer,
            schedule,
            schedule_state,
            stripes,
            table: Arc::new(table),
            pool,
            stats: EngineStats::default(),
            closed: AtomicBool::new(false),
        };

        tracing::info!(
            embedding = %engine.options.embedding_name,
            embedding_size = layout.dim(),
            optimizer = engine.optimizer.name(),
            initializer = engine.initializer.name(),
            l1_capacity = engine.l1_capacity(),
            l2_capacity = engine.l2_capacity(),
            stripes = engine.stripes.len(),
            workers = engine.options.runtime.num_workers,
            step = engine.schedule_state.current(),
            "Opened embedding engine"
        );
        Ok(engine)
    }

    /// Returns one row per id, in input order.
    ///
    /// Unseen keys are initialized. Every returned key ends resident in L1.
    ///
    /// # Errors
    ///
    /// Fails the whole batch on fixed-table I/O errors or timeouts; no rows
    /// are returned in that case.
    pub fn lookup(&self, ids: &[FeatureId]) -> Result<Embeddings> {
        let dim = self.layout.dim();
        if ids.is_empty() {
            return Ok(Embeddings::empty(dim));
        }
        EngineStats::incr(&self.stats.lookups);

        let batch = BatchKeys::new(ids.iter().map(|&id| Key::from_id(id)));
        let result = self.execute(&batch, |working| {
            let mut keys = Vec::with_capacity(batch.slots.len());
            let mut versions = Vec::with_capacity(batch.slots.len());
            let mut values = Vec::with_capacity(batch.slots.len() * dim);
            for &slot in &batch.slots {
                let record = &working[slot].record;
                keys.push(record.key);
                versions.push(record.version);
                values.extend_from_slice(&record.embedding);
            }
            Ok(Embeddings::new(keys, versions, values, dim))
        });
        if result.is_ok() {
            EngineStats::add(&self.stats.keys_looked_up, batch.unique.len() as u64);
        }
        self.finish(result)
    }

    /// Like [`lookup`](Self::lookup), converted to the configured `dtype`.
    pub fn lookup_typed(&self, ids: &[FeatureId]) -> Result<TypedEmbeddings> {
        Ok(self.lookup(ids)?.to_typed(self.options.dtype))
    }

    /// Applies one optimizer step per unique id.
    ///
    /// `gradients` is row-major `[ids.len(), embedding_size]`. Rows of
    /// duplicate ids are summed. The schedule step advances once per call.
    pub fn apply_gradient(&self, ids: &[FeatureId], gradients: &[f32]) -> Result<()> {
        self.check_gradient_shape(ids.len(), gradients.len())?;
        let keys: Vec<Key> = ids.iter().map(|&id| Key::from_id(id)).collect();
        self.update(&keys, gradients, None)
    }

    /// Applies gradients for the rows of an earlier lookup.
    ///
    /// # Errors
    ///
    /// Returns [`EmbeddingError::StaleUpdate`] without touching any key if a
    /// key was updated since `lookup` read it.
    pub fn apply_gradient_checked(&self, lookup: &Embeddings, gradients: &[f32]) -> Result<()> {
        if lookup.dim() != self.layout.dim() {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.layout.dim(),
                actual: lookup.dim(),
            });
        }
        self.check_gradient_shape(lookup.len(), gradients.len())?;
        self.update(lookup.keys(), gradients, Some(lookup.versions()))
    }

    fn check_gradient_shape(&self, ids: usize, values: usize) -> Result<()> {
        let dim = self.layout.dim();
        if values == ids * dim {
            return Ok(());
        }
        if values % dim == 0 {
            Err(EmbeddingError::CountMismatch {
                ids,
                rows: values / dim,
            })
        } else {
            Err(EmbeddingError::DimensionMismatch {
                expected: ids * dim,
                actual: values,
            })
        }
    }

    fn update(&self, keys: &[Key], gradients: &[f32], observed: Option<&[u64]>) -> Result<()> {
        EngineStats::incr(&self.stats.updates);
        if keys.is_empty() {
            self.schedule_state.advance();
            return Ok(());
        }

        let dim = self.layout.dim();
        let batch = BatchKeys::new(keys.iter().copied());
        let summed = batch.sum_rows(gradients, dim);
        let expected = observed.map(|versions| batch.first_of_each(versions));

        let result = self.execute(&batch, |working| {
            if let Some(expected) = &expected {
                for (entry, &observed) in working.iter().zip(expected) {
                    if entry.record.version != observed {
                        return Err(EmbeddingError::StaleUpdate {
                            key: entry.record.key,
                            observed,
                            current: entry.record.version,
                        });
                    }
                }
            }

            let step = self.schedule_state.advance();
            let learning_rate = self.schedule.value(step);
            self.pool.install(|| {
                working
                    .par_iter_mut()
                    .zip(summed.par_chunks(dim))
                    .for_each(|(entry, gradient)| {
                        let record = &mut entry.record;
                        self.optimizer.apply(
                            &mut record.embedding,
                            &mut record.state,
                            gradient,
                            learning_rate,
                        );
                        record.version += 1;
                        record.dirty = true;
                    });
            });
            tracing::trace!(
                embedding = %self.options.embedding_name,
                step,
                learning_rate,
                keys = working.len(),
                "Applied gradient batch"
            );
            Ok(())
        });
        if result.is_ok() {
            EngineStats::add(&self.stats.keys_updated, batch.unique.len() as u64);
        }
        self.finish(result)
    }

    fn finish<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            EngineStats::incr(&self.stats.failed_batches);
            tracing::warn!(
                embedding = %self.options.embedding_name,
                error = %err,
                "Embedding batch failed"
            );
        }
        result
    }

    fn execute<R>(
        &self,
        batch: &BatchKeys,
        body: impl FnOnce(&mut [Working]) -> Result<R>,
    ) -> Result<R> {
        let (mut locked, stripe_of) = self.lock_stripes(&batch.unique);
        let deadline = Deadline::start(self.io_timeout);
        let mut undo = Undo::default();

        let mut slots: Vec<Option<Working>> = Vec::with_capacity(batch.unique.len());
        slots.resize_with(batch.unique.len(), || None);
        let mut misses: Vec<(usize, bool)> = Vec::new();
        for (pos, stripe) in locked.iter_mut().enumerate() {
            for &i in &stripe.members {
                match self.take_resident(&mut stripe.guard, pos, batch.unique[i], &mut undo) {
                    Resident::Found(entry) => slots[i] = Some(entry),
                    Resident::Missing => misses.push((i, false)),
                    Resident::Diverged => misses.push((i, true)),
                }
            }
        }

        let resolved = if misses.is_empty() {
            Ok(Vec::new())
        } else {
            self.resolve_misses(batch, &misses, &deadline)
        };
        let resolved = match resolved {
            Ok(resolved) => resolved,
            Err(err) => {
                let taken = slots
                    .into_iter()
                    .enumerate()
                    .filter_map(|(i, slot)| slot.map(|entry| (i, entry)));
                self.rollback(&mut locked, &stripe_of, taken, undo);
                return Err(err);
            }
        };
        for ((i, _), entry) in misses.into_iter().zip(resolved) {
            slots[i] = Some(entry);
        }
        let mut working: Vec<Working> = slots.into_iter().flatten().collect();

        if let Err(err) = self.make_room(&mut locked, working.len(), &deadline) {
            self.rollback(&mut locked, &stripe_of, working.into_iter().enumerate(), undo);
            return Err(err);
        }

        let output = match body(&mut working) {
            Ok(output) => output,
            Err(err) => {
                self.rollback(&mut locked, &stripe_of, working.into_iter().enumerate(), undo);
                return Err(err);
            }
        };

        self.place(&mut locked, &stripe_of, working);
        Ok(output)
    }

    fn stripe_of(&self, key: Key) -> usize {
        key.bucket(self.stripes.len())
    }

    /// Locks the stripes of `keys` in ascending order.
    ///
    /// Also returns, for each key, the position of its stripe in the locked
    /// list.
    fn lock_stripes(&self, keys: &[Key]) -> (Vec<LockedStripe<'_>>, Vec<usize>) {
        let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (i, &key) in keys.iter().enumerate() {
            groups.entry(self.stripe_of(key)).or_default().push(i);
        }

        let mut stripe_of = vec![0; keys.len()];
        let locked = groups
            .into_iter()
            .enumerate()
            .map(|(pos, (stripe, members))| {
                for &i in &members {
                    stripe_of[i] = pos;
                }
                LockedStripe {
                    guard: self.stripes[stripe].lock(),
                    members,
                }
            })
            .collect();
        (locked, stripe_of)
    }

    fn take_resident(&self, stripe: &mut Stripe, pos: usize, key: Key, undo: &mut Undo) -> Resident {
        let in_l1 = stripe.l1.take(key);
        let in_l2 = stripe.l2.take(key);
        let (record, origin) = match (in_l1, in_l2) {
            (None, None) => return Resident::Missing,
            (Some(record), None) => {
                EngineStats::incr(&self.stats.l1_hits);
                (record, Origin::L1)
            }
            (None, Some(record)) => {
                EngineStats::incr(&self.stats.l2_hits);
                (record, Origin::L2)
            }
            (Some(l1), Some(l2)) => match self.reconcile(pos, l1, l2, undo) {
                Some(kept) => kept,
                None => return Resident::Diverged,
            },
        };

        let dim = self.layout.dim();
        if record.dim() != dim || !record.state.matches(self.layout.optimizer(), dim) {
            EngineStats::incr(&self.stats.consistency_repairs);
            tracing::warn!(
                embedding = %self.options.embedding_name,
                key = %key,
                dim = record.dim(),
                "Cached record has the wrong shape; reloading from the fixed table"
            );
            let tier = match origin {
                Origin::L2 => TierKind::L2,
                _ => TierKind::L1,
            };
            undo.discarded.push((pos, tier, record));
            return Resident::Diverged;
        }
        Resident::Found(Working { record, origin })
    }

    /// Settles a key found in both L1 and L2.
    ///
    /// The higher version wins. Equal versions with equal contents keep the
    /// L1 copy; equal versions with different contents keep neither, and the
    /// key is reloaded from the fixed table.
    fn reconcile(
        &self,
        pos: usize,
        l1: EmbeddingRecord,
        l2: EmbeddingRecord,
        undo: &mut Undo,
    ) -> Option<(EmbeddingRecord, Origin)> {
        EngineStats::incr(&self.stats.consistency_repairs);
        let key = l1.key;
        let agree = l1.embedding == l2.embedding && l1.state == l2.state;
        if l1.version == l2.version && !agree {
            tracing::warn!(
                embedding = %self.options.embedding_name,
                key = %key,
                version = l1.version,
                "Cache tiers hold diverged copies; reloading from the fixed table"
            );
            undo.discarded.push((pos, TierKind::L1, l1));
            undo.discarded.push((pos, TierKind::L2, l2));
            return None;
        }

        let (mut kept, origin, dropped, dropped_tier) = if l2.version > l1.version {
            (l2, Origin::L2, l1, TierKind::L1)
        } else {
            (l1, Origin::L1, l2, TierKind::L2)
        };
        tracing::warn!(
            embedding = %self.options.embedding_name,
            key = %key,
            kept_version = kept.version,
            dropped_version = dropped.version,
            dropped_tier = %dropped_tier,
            "Key resident in both cache tiers; keeping the newer copy"
        );
        kept.dirty |= dropped.dirty;
        undo.discarded.push((pos, dropped_tier, dropped));
        Some((kept, origin))
    }

    /// Loads or initializes every key missing from both caches.
    fn resolve_misses(
        &self,
        batch: &BatchKeys,
        misses: &[(usize, bool)],
        deadline: &Deadline,
    ) -> Result<Vec<Working>> {
        let stored: Vec<Key> = misses
            .iter()
            .map(|&(i, _)| batch.unique[i])
            .filter(|&key| self.table.contains(key))
            .collect();
        let mut rows = if stored.is_empty() {
            HashMap::new()
        } else {
            self.read_rows(stored, deadline)?
        };

        let pending: Vec<(Key, bool, Option<EmbeddingRecord>)> = misses
            .iter()
            .map(|&(i, require_row)| {
                let key = batch.unique[i];
                (key, require_row, rows.remove(&key))
            })
            .collect();
        self.pool.install(|| {
            pending
                .into_par_iter()
                .map(|(key, require_row, stored)| self.materialize(key, require_row, stored))
                .collect()
        })
    }

    /// Reads `keys` from the fixed table on the worker pool.
    ///
    /// Waits at most until the deadline. A read still running after that is
    /// left to finish on its worker and its result is dropped.
    fn read_rows(
        &self,
        keys: Vec<Key>,
        deadline: &Deadline,
    ) -> Result<HashMap<Key, EmbeddingRecord>> {
        deadline.check()?;
        let (tx, rx) = mpsc::channel();
        let table = Arc::clone(&self.table);
        self.pool.spawn(move || {
            let rows = keys
                .par_iter()
                .map(|&key| Ok(table.get(key)?.map(|record| (key, record))))
                .collect::<Result<Vec<_>>>();
            // The batch may have timed out and hung up already.
            let _ = tx.send(rows);
        });

        match rx.recv_timeout(deadline.remaining()) {
            Ok(rows) => Ok(rows?.into_iter().flatten().collect()),
            Err(RecvTimeoutError::Timeout) => Err(deadline.expired()),
            Err(RecvTimeoutError::Disconnected) => Err(EmbeddingError::storage(
                "reading missed keys",
                io::Error::new(io::ErrorKind::Other, "read worker exited without a result"),
            )),
        }
    }

    fn materialize(
        &self,
        key: Key,
        require_row: bool,
        stored: Option<EmbeddingRecord>,
    ) -> Result<Working> {
        match stored {
            Some(record) => {
                EngineStats::incr(&self.stats.fixed_hits);
                Ok(Working {
                    record,
                    origin: Origin::Fixed,
                })
            }
            None if require_row => Err(EmbeddingError::KeyConsistency {
                key,
                message: "cached copies diverged and the fixed table has no row to reload"
                    .to_string(),
            }),
            None => {
                EngineStats::incr(&self.stats.initializations);
                let dim = self.layout.dim();
                let record = EmbeddingRecord::new(
                    key,
                    self.initializer.initialize(key, dim),
                    self.optimizer.initial_state(dim),
                );
                Ok(Working {
                    record,
                    origin: Origin::Initialized,
                })
            }
        }
    }

    /// Evicts L1 records until the tier can seat `incoming` more.
    ///
    /// Victims come from the fullest stripe this batch holds. When those are
    /// empty, other stripes are tried without blocking. If every stripe is
    /// empty or busy the batch goes over budget and later batches evict the
    /// excess.
    fn make_room(
        &self,
        locked: &mut [LockedStripe<'_>],
        incoming: usize,
        deadline: &Deadline,
    ) -> Result<()> {
        loop {
            let Some(first) = locked.first() else {
                return Ok(());
            };
            let l1 = &first.guard.l1;
            if l1.resident() + incoming <= l1.capacity() {
                return Ok(());
            }

            let fullest = locked
                .iter()
                .enumerate()
                .filter(|(_, stripe)| !stripe.guard.l1.is_empty())
                .max_by_key(|(_, stripe)| stripe.guard.l1.len())
                .map(|(pos, _)| pos);
            let evicted = match fullest {
                Some(pos) => self.evict_l1(&mut locked[pos].guard, deadline)?,
                None => self.evict_l1_elsewhere(deadline)?,
            };
            if !evicted {
                return Ok(());
            }
        }
    }

    /// Evicts the least recently used L1 record of `stripe`.
    fn evict_l1(&self, stripe: &mut Stripe, deadline: &Deadline) -> Result<bool> {
        let Some(victim) = stripe.l1.pop_lru() else {
            return Ok(false);
        };
        if let Err((err, victim)) = self.demote(stripe, victim, deadline) {
            stripe.l1.restore(victim);
            return Err(err);
        }
        EngineStats::incr(&self.stats.evictions);
        Ok(true)
    }

    /// Evicts one L1 record from any stripe that is free to lock right now.
    fn evict_l1_elsewhere(&self, deadline: &Deadline) -> Result<bool> {
        for stripe in &self.stripes {
            let Some(mut stripe) = stripe.try_lock() else {
                continue;
            };
            if self.evict_l1(&mut stripe, deadline)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Moves an L1 victim down one level.
    ///
    /// With L2 enabled the victim goes to L2, flushing L2's own dirty victims
    /// first. Otherwise a dirty victim is written to the fixed table and a
    /// clean one is dropped. On failure the record that could not be placed
    /// is handed back.
    fn demote(
        &self,
        stripe: &mut Stripe,
        record: EmbeddingRecord,
        deadline: &Deadline,
    ) -> std::result::Result<(), (EmbeddingError, EmbeddingRecord)> {
        if !stripe.l2.is_enabled() {
            if record.dirty {
                if let Err(err) = self.persist(&record, deadline) {
                    return Err((err, record));
                }
            }
            tracing::debug!(
                embedding = %self.options.embedding_name,
                key = %record.key,
                dirty = record.dirty,
                "Demoted record to the fixed table"
            );
            return Ok(());
        }

        if let Err(err) = self.make_room_in_l2(stripe, deadline) {
            return Err((err, record));
        }

        tracing::debug!(
            embedding = %self.options.embedding_name,
            key = %record.key,
            dirty = record.dirty,
            "Demoted record to l2_cache"
        );
        match stripe.l2.put(record) {
            Some(spilled) if spilled.dirty => match self.persist(&spilled, deadline) {
                Ok(()) => Ok(()),
                Err(err) => Err((err, spilled)),
            },
            _ => Ok(()),
        }
    }

    /// Frees one L2 slot, from `stripe` first and then from any free stripe.
    fn make_room_in_l2(&self, stripe: &mut Stripe, deadline: &Deadline) -> Result<()> {
        if stripe.l2.resident() < stripe.l2.capacity() {
            return Ok(());
        }
        if self.evict_l2(stripe, deadline)? {
            return Ok(());
        }
        for other in &self.stripes {
            let Some(mut other) = other.try_lock() else {
                continue;
            };
            if self.evict_l2(&mut other, deadline)? {
                return Ok(());
            }
        }
        Ok(())
    }

    fn evict_l2(&self, stripe: &mut Stripe, deadline: &Deadline) -> Result<bool> {
        let Some(victim) = stripe.l2.pop_lru() else {
            return Ok(false);
        };
        if victim.dirty {
            if let Err(err) = self.persist(&victim, deadline) {
                stripe.l2.restore(victim);
                return Err(err);
            }
        }
        EngineStats::incr(&self.stats.evictions);
        Ok(true)
    }

    /// Writes one record and checks the deadline once it returns.
    ///
    /// Writes are not abandoned midway: the record is owned by the batch and
    /// would otherwise be lost.
    fn persist(&self, record: &EmbeddingRecord, deadline: &Deadline) -> Result<()> {
        deadline.check()?;
        self.table.put(record)?;
        EngineStats::incr(&self.stats.rows_written);
        deadline.check()
    }

    /// Seats the working set in L1.
    ///
    /// `make_room` left space for every member unless the batch is larger
    /// than L1 or every other stripe was busy. The surplus is restored as
    /// least recently used, so the next batch evicts it first.
    fn place(&self, locked: &mut [LockedStripe<'_>], stripe_of: &[usize], working: Vec<Working>) {
        let mut surplus: Vec<(usize, EmbeddingRecord)> = Vec::new();
        for (i, entry) in working.into_iter().enumerate() {
            let pos = stripe_of[i];
            let l1 = &mut locked[pos].guard.l1;
            if l1.resident() < l1.capacity() {
                if let Some(spilled) = l1.put(entry.record) {
                    surplus.push((pos, spilled));
                }
            } else {
                surplus.push((pos, entry.record));
            }
        }

        for (pos, mut record) in surplus {
            tracing::debug!(
                embedding = %self.options.embedding_name,
                key = %record.key,
                "L1 is full; keeping record over budget"
            );
            record.generation = 0;
            locked[pos].guard.l1.restore(record);
        }
    }

    /// Puts every record a failed batch took back into its tier.
    ///
    /// Records read from the fixed table or freshly initialized are dropped;
    /// the table still holds the former and the initializer reproduces the
    /// latter.
    fn rollback(
        &self,
        locked: &mut [LockedStripe<'_>],
        stripe_of: &[usize],
        working: impl IntoIterator<Item = (usize, Working)>,
        undo: Undo,
    ) {
        let mut restored = 0usize;
        for (i, entry) in working {
            let stripe = &mut *locked[stripe_of[i]].guard;
            match entry.origin {
                Origin::L1 => stripe.restore(TierKind::L1, entry.record),
                Origin::L2 => stripe.restore(TierKind::L2, entry.record),
                Origin::Fixed | Origin::Initialized => continue,
            }
            restored += 1;
        }
        for (pos, tier, record) in undo.discarded {
            locked[pos].guard.restore(tier, record);
            restored += 1;
        }
        tracing::debug!(
            embedding = %self.options.embedding_name,
            restored,
            "Rolled back failed batch"
        );
    }

    /// Writes every dirty cached record to the fixed table and checkpoints it.
    ///
    /// Returns the number of records written.
    ///
    /// # Errors
    ///
    /// Returns [`EmbeddingError::Timeout`] once the writes have taken longer
    /// than `runtime.io_timeout_ms`, checked after each stripe tier is
    /// written. Records not yet marked clean stay dirty for the next flush.
    pub fn flush(&self) -> Result<usize> {
        let deadline = Deadline::start(self.io_timeout);
        let mut written = 0;
        for stripe in &self.stripes {
            let mut stripe = stripe.lock();
            let Stripe { l1, l2 } = &mut *stripe;
            for tier in [l1, l2] {
                let dirty = tier.dirty_keys();
                if dirty.is_empty() {
                    continue;
                }
                deadline.check()?;
                let view: &dyn CacheTier = &**tier;
                let records: Vec<&EmbeddingRecord> =
                    dirty.iter().filter_map(|&key| view.peek(key)).collect();
                let count = self.table.put_all(records)?;
                EngineStats::add(&self.stats.rows_written, count as u64);
                deadline.check()?;
                for key in dirty {
                    tier.mark_clean(key);
                }
                written += count;
            }
        }

        let step = self.schedule_state.current();
        self.table.checkpoint(step)?;
        tracing::info!(
            embedding = %self.options.embedding_name,
            written,
            step,
            "Flushed embedding engine"
        );
        Ok(written)
    }

    /// Flushes and closes the engine.
    pub fn close(self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.flush()?;
        tracing::info!(
            embedding = %self.options.embedding_name,
            stats = %self.stats(),
            "Closed embedding engine"
        );
        Ok(())
    }

    /// A snapshot of the engine counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// The options the engine was opened with.
    pub fn options(&self) -> &EmbeddingOptions {
        &self.options
    }

    /// Table name.
    pub fn name(&self) -> &str {
        &self.options.embedding_name
    }

    /// Embedding width.
    pub fn embedding_size(&self) -> usize {
        self.layout.dim()
    }

    /// Output type of [`lookup_typed`](Self::lookup_typed).
    pub fn dtype(&self) -> DataType {
        self.options.dtype
    }

    /// The step the next update batch will use.
    pub fn global_step(&self) -> u64 {
        self.schedule_state.current()
    }

    /// Learning rate the next update batch will use.
    pub fn learning_rate(&self) -> f32 {
        self.schedule.value(self.schedule_state.current())
    }

    /// The persistent table.
    pub fn table(&self) -> &FixedTable {
        &self.table
    }

    /// L1 capacity in records.
    pub fn l1_capacity(&self) -> usize {
        self.stripes.first().map_or(0, |s| s.lock().l1.capacity())
    }

    /// L2 capacity in records, 0 when L2 is disabled.
    pub fn l2_capacity(&self) -> usize {
        self.stripes.first().map_or(0, |s| s.lock().l2.capacity())
    }

    /// Number of records resident in L1 and L2.
    pub fn resident_records(&self) -> (usize, usize) {
        self.stripes.iter().fold((0, 0), |(l1, l2), stripe| {
            let stripe = stripe.lock();
            (l1 + stripe.l1.len(), l2 + stripe.l2.len())
        })
    }
}

impl Drop for EmbeddingEngine {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(err) = self.flush() {
            tracing::error!(
                embedding = %self.options.embedding_name,
                error = %err,
                "Failed to flush embedding engine on drop"
            );
        }
    }
}

/// Sizes both cache tiers and splits them into lock stripes.
fn build_stripes(options: &EmbeddingOptions, layout: RecordLayout) -> Result<Vec<Mutex<Stripe>>> {
    let footprint = layout.footprint();
    let count = options.runtime.num_shards.max(1);

    let l1 = build_striped_tiers(TierKind::L1, &options.l1_cache, footprint, count)?;
    let l2 = build_striped_tiers(TierKind::L2, &options.l2_cache, footprint, count)?;
    Ok(l1
        .into_iter()
        .zip(l2)
        .map(|(l1, l2)| Mutex::new(Stripe { l1, l2 }))
        .collect())
}
