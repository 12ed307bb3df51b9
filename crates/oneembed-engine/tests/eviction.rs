mod common;

use oneembed_core::{CacheOptions, EmbeddingError, OptimizerKind, OptimizerOptions, TierKind};
use oneembed_engine::EmbeddingEngine;
use tempfile::tempdir;

use common::{two_record_options, zeros, WIDE_DIM};

#[test]
fn test_dirty_record_is_flushed_before_eviction() {
    let dir = tempdir().unwrap();
    let mut options = two_record_options(dir.path());
    options.initializer = zeros();
    let engine = EmbeddingEngine::open(options).unwrap();
    assert_eq!(engine.l1_capacity(), 2);

    engine.apply_gradient(&[1], &vec![1.0; WIDE_DIM]).unwrap();
    engine.lookup(&[2]).unwrap();
    engine.lookup(&[3]).unwrap();

    let stats = engine.stats();
    assert_eq!(stats.evictions, 1);
    assert_eq!(stats.rows_written, 1);
    assert!(engine.table().contains(oneembed_core::Key::from_id(1)));

    let rows = engine.lookup(&[1]).unwrap();
    assert!(rows.row(0).unwrap().iter().all(|&v| (v + 0.1).abs() < 1e-6));
    assert_eq!(rows.versions(), &[1]);
    assert_eq!(engine.stats().fixed_hits, 1);
}

#[test]
fn test_one_insert_past_capacity_evicts_exactly_one() {
    let dir = tempdir().unwrap();
    let engine = EmbeddingEngine::open(two_record_options(dir.path())).unwrap();

    engine.lookup(&[1, 2]).unwrap();
    assert_eq!(engine.resident_records(), (2, 0));
    assert_eq!(engine.stats().evictions, 0);

    engine.lookup(&[3]).unwrap();
    assert_eq!(engine.resident_records(), (2, 0));
    assert_eq!(engine.stats().evictions, 1);
}

#[test]
fn test_striped_l1_evicts_only_when_the_whole_tier_is_full() {
    let dir = tempdir().unwrap();
    let mut options = common::options(dir.path(), 128);
    options.l1_cache = CacheOptions::lru(1);
    let engine = EmbeddingEngine::open(options).unwrap();
    // A 128-wide sgd record costs 512 bytes, spread over 64 stripes.
    let capacity = engine.l1_capacity();
    assert_eq!(capacity, 2048);

    let ids: Vec<i64> = (0..capacity as i64).collect();
    for chunk in ids.chunks(256) {
        engine.lookup(chunk).unwrap();
    }
    assert_eq!(engine.resident_records(), (capacity, 0));
    assert_eq!(engine.stats().evictions, 0);

    engine.lookup(&[capacity as i64]).unwrap();
    assert_eq!(engine.resident_records(), (capacity, 0));
    assert_eq!(engine.stats().evictions, 1);
}

#[test]
fn test_hit_refreshes_recency() {
    let dir = tempdir().unwrap();
    let engine = EmbeddingEngine::open(two_record_options(dir.path())).unwrap();

    engine.lookup(&[1]).unwrap();
    engine.lookup(&[2]).unwrap();
    engine.lookup(&[1]).unwrap();
    engine.lookup(&[3]).unwrap();

    // Key 2 was least recently used, so it went to the fixed table.
    assert!(engine.table().contains(oneembed_core::Key::from_id(2)));
    assert!(!engine.table().contains(oneembed_core::Key::from_id(1)));
}

#[test]
fn test_l2_holds_l1_victims_and_spills_to_fixed_table() {
    let dir = tempdir().unwrap();
    let mut options = two_record_options(dir.path());
    options.initializer = zeros();
    options.l2_cache = CacheOptions::lru(1);
    let engine = EmbeddingEngine::open(options).unwrap();
    assert_eq!(engine.l2_capacity(), 2);

    engine.apply_gradient(&[1], &vec![2.0; WIDE_DIM]).unwrap();
    engine.lookup(&[2]).unwrap();
    engine.lookup(&[3]).unwrap();
    assert_eq!(engine.resident_records(), (2, 1));
    assert!(engine.table().is_empty());

    engine.lookup(&[4]).unwrap();
    engine.lookup(&[5]).unwrap();
    assert_eq!(engine.resident_records(), (2, 2));
    assert!(engine.table().contains(oneembed_core::Key::from_id(1)));

    let rows = engine.lookup(&[1]).unwrap();
    assert!(rows.row(0).unwrap().iter().all(|&v| (v + 0.2).abs() < 1e-6));

    let stats = engine.stats();
    assert_eq!(stats.fixed_hits, 1);
    assert_eq!(stats.l2_hits, 0);
    engine.lookup(&[3]).unwrap();
    assert_eq!(engine.stats().l2_hits, 1);
}

#[test]
fn test_batch_wider_than_l1_keeps_every_row() {
    let dir = tempdir().unwrap();
    let mut options = two_record_options(dir.path());
    options.initializer = zeros();
    let engine = EmbeddingEngine::open(options).unwrap();

    engine
        .apply_gradient(&[1, 2, 3], &vec![1.0; 3 * WIDE_DIM])
        .unwrap();
    assert_eq!(engine.resident_records(), (3, 0));

    // The next batch evicts back down to budget without losing the update.
    engine.lookup(&[4]).unwrap();
    assert_eq!(engine.resident_records(), (2, 0));
    let rows = engine.lookup(&[1, 2, 3]).unwrap();
    assert!(rows.values().iter().all(|&v| (v + 0.1).abs() < 1e-6));
}

#[test]
fn test_budget_below_one_record_is_a_capacity_error() {
    let dir = tempdir().unwrap();
    let mut options = two_record_options(dir.path());
    options.optimizer = OptimizerOptions::of(OptimizerKind::Adam);

    let err = EmbeddingEngine::open(options.clone()).unwrap_err();
    assert!(matches!(
        err,
        EmbeddingError::Capacity {
            tier: TierKind::L1,
            ..
        }
    ));
    assert!(err.is_construction_error());

    options.optimizer = OptimizerOptions::of(OptimizerKind::Sgd);
    options.l2_cache = CacheOptions::lru(0);
    let err = EmbeddingEngine::open(options).unwrap_err();
    assert!(matches!(
        err,
        EmbeddingError::Capacity {
            tier: TierKind::L2,
            ..
        }
    ));
}

#[test]
fn test_flush_writes_dirty_records_once() {
    let dir = tempdir().unwrap();
    let engine = EmbeddingEngine::open(common::options(dir.path(), 4)).unwrap();

    engine.lookup(&[1, 2, 3]).unwrap();
    assert_eq!(engine.flush().unwrap(), 3);
    assert_eq!(engine.flush().unwrap(), 0);

    engine.apply_gradient(&[2], &[1.0; 4]).unwrap();
    assert_eq!(engine.flush().unwrap(), 1);
    assert_eq!(engine.table().meta().last_step, 1);
}
