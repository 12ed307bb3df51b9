mod common;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use oneembed_core::{EmbeddingError, EmbeddingOptions};
use oneembed_engine::EmbeddingEngine;
use oneembed_storage::BlockDevice;
use tempfile::tempdir;

use common::{two_record_options, zeros, FaultyDevice, WIDE_DIM};

fn open(options: &EmbeddingOptions, device: &Arc<FaultyDevice>) -> EmbeddingEngine {
    let device: Box<dyn BlockDevice> = Box::new(Arc::clone(device));
    EmbeddingEngine::open_with_device(options.clone(), device).unwrap()
}

/// Writes keys 1 and 2 (updated once) through a first engine and closes it.
fn seeded(options: &EmbeddingOptions, device: &Arc<FaultyDevice>) {
    let engine = open(options, device);
    let dim = options.embedding_size;
    engine.apply_gradient(&[1, 2], &vec![1.0; 2 * dim]).unwrap();
    engine.close().unwrap();
}

#[test]
fn test_read_failure_fails_the_whole_batch() {
    let dir = tempdir().unwrap();
    let mut options = common::options(dir.path(), 4);
    options.initializer = zeros();
    let (device, faults) = FaultyDevice::new(512);
    seeded(&options, &device);

    let engine = open(&options, &device);
    assert_eq!(engine.table().len(), 2);

    faults.fail_reads(true);
    let err = engine.lookup(&[3, 1]).unwrap_err();
    assert!(matches!(err, EmbeddingError::StorageIo { .. }), "{err}");
    assert_eq!(engine.resident_records(), (0, 0));
    assert_eq!(engine.stats().failed_batches, 1);

    let err = engine.apply_gradient(&[2], &[1.0; 4]).unwrap_err();
    assert!(matches!(err, EmbeddingError::StorageIo { .. }));
    assert_eq!(engine.global_step(), 1);

    faults.clear();
    let rows = engine.lookup(&[3, 1]).unwrap();
    assert_eq!(rows.row(0).unwrap(), &[0.0; 4]);
    assert!(rows.row(1).unwrap().iter().all(|&v| (v + 0.1).abs() < 1e-6));
    assert_eq!(rows.versions(), &[0, 1]);
}

#[test]
fn test_failed_batch_leaves_resident_keys_in_place() {
    let dir = tempdir().unwrap();
    let options = common::options(dir.path(), 4);
    let (device, faults) = FaultyDevice::new(512);
    seeded(&options, &device);

    let engine = open(&options, &device);
    let resident = engine.lookup(&[1]).unwrap();

    faults.fail_reads(true);
    engine.lookup(&[1, 2]).unwrap_err();
    assert_eq!(engine.resident_records(), (1, 0));

    // Key 1 is served from L1 without touching the failing device.
    assert_eq!(engine.lookup(&[1]).unwrap(), resident);
}

#[test]
fn test_write_failure_during_eviction_fails_the_batch() {
    let dir = tempdir().unwrap();
    let options = two_record_options(dir.path());
    let (device, faults) = FaultyDevice::new(512);
    let engine = open(&options, &device);

    let before = engine.lookup(&[1, 2]).unwrap();
    faults.fail_writes(true);
    let err = engine.lookup(&[3]).unwrap_err();
    assert!(matches!(err, EmbeddingError::StorageIo { .. }), "{err}");
    assert_eq!(engine.resident_records(), (2, 0));
    assert!(engine.table().is_empty());

    faults.clear();
    engine.lookup(&[3]).unwrap();
    assert_eq!(engine.stats().evictions, 1);
    let again = engine.lookup(&[1, 2]).unwrap();
    assert_eq!(again.values(), before.values());
    assert_eq!(again.row(0).unwrap().len(), WIDE_DIM);
}

#[test]
fn test_stalled_read_times_out() {
    let dir = tempdir().unwrap();
    let mut options = common::options(dir.path(), 4);
    options.runtime.io_timeout_ms = 20;
    let (device, faults) = FaultyDevice::new(512);
    seeded(&options, &device);

    let engine = open(&options, &device);
    faults.stall_reads(Duration::from_millis(60));
    let err = engine.lookup(&[1]).unwrap_err();
    match err {
        EmbeddingError::Timeout { elapsed, limit } => {
            assert_eq!(limit, Duration::from_millis(20));
            assert!(elapsed >= limit);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(engine.resident_records(), (0, 0));

    faults.clear();
    assert_eq!(engine.lookup(&[1]).unwrap().versions(), &[1]);
}

#[test]
fn test_long_stall_returns_at_the_deadline() {
    let dir = tempdir().unwrap();
    let mut options = common::options(dir.path(), 4);
    options.runtime.io_timeout_ms = 50;
    let (device, faults) = FaultyDevice::new(512);
    seeded(&options, &device);

    let engine = open(&options, &device);
    faults.stall_reads(Duration::from_secs(2));
    let started = Instant::now();
    let err = engine.lookup(&[1, 2]).unwrap_err();
    let waited = started.elapsed();
    assert!(matches!(err, EmbeddingError::Timeout { .. }), "{err}");
    assert!(waited < Duration::from_secs(1), "waited {waited:?}");
    assert_eq!(engine.resident_records(), (0, 0));
    assert_eq!(engine.stats().failed_batches, 1);
}

#[test]
fn test_waiting_for_a_stripe_does_not_count_against_io_timeout() {
    let dir = tempdir().unwrap();
    let mut options = common::options(dir.path(), 4);
    options.runtime.num_shards = 1;
    options.runtime.io_timeout_ms = 400;
    let (device, faults) = FaultyDevice::new(512);
    seeded(&options, &device);

    let engine = open(&options, &device);
    faults.stall_reads(Duration::from_millis(250));
    let (first, second) = thread::scope(|scope| {
        let first = scope.spawn(|| engine.lookup(&[1]));
        thread::sleep(Duration::from_millis(50));
        let second = scope.spawn(|| engine.lookup(&[2]));
        (first.join().unwrap(), second.join().unwrap())
    });
    assert_eq!(first.unwrap().versions(), &[1]);
    assert_eq!(second.unwrap().versions(), &[1]);
    assert_eq!(engine.stats().fixed_hits, 2);
}

#[test]
fn test_stalled_flush_times_out_and_keeps_records_dirty() {
    let dir = tempdir().unwrap();
    let mut options = common::options(dir.path(), 4);
    options.runtime.io_timeout_ms = 20;
    let (device, faults) = FaultyDevice::new(512);
    let engine = open(&options, &device);
    engine.apply_gradient(&[5], &[1.0; 4]).unwrap();

    faults.stall_writes(Duration::from_millis(60));
    let err = engine.flush().unwrap_err();
    assert!(matches!(err, EmbeddingError::Timeout { .. }), "{err}");

    faults.clear();
    assert_eq!(engine.flush().unwrap(), 1);
    assert_eq!(engine.flush().unwrap(), 0);
    assert_eq!(engine.table().meta().last_step, 1);
}

#[test]
fn test_drop_flushes_dirty_records() {
    let dir = tempdir().unwrap();
    let options = common::options(dir.path(), 4);
    let (device, _faults) = FaultyDevice::new(512);
    {
        let engine = open(&options, &device);
        engine.apply_gradient(&[8], &[1.0; 4]).unwrap();
    }

    let engine = open(&options, &device);
    assert_eq!(engine.global_step(), 1);
    assert_eq!(engine.lookup(&[8]).unwrap().versions(), &[1]);
}
