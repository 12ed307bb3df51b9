#![allow(dead_code)]

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use oneembed_core::{
    CacheOptions, EmbeddingError, EmbeddingOptions, InitializerKind, InitializerOptions,
    LearningRateScheduleOptions, Result,
};
use oneembed_storage::{BlockDevice, MemoryBlockDevice};

/// Width at which one sgd record costs 512 KiB, so a 1 MiB budget holds two.
pub const WIDE_DIM: usize = 128 * 1024;

/// Small-table options with a constant learning rate.
pub fn options(dir: &Path, dim: usize) -> EmbeddingOptions {
    let mut options = EmbeddingOptions::new("test", dim, dir);
    options.l1_cache = CacheOptions::lru(64);
    options.learning_rate_schedule = LearningRateScheduleOptions::constant(0.1);
    options.runtime.num_workers = 4;
    options
}

/// Options whose L1 holds exactly two records in a single stripe.
pub fn two_record_options(dir: &Path) -> EmbeddingOptions {
    let mut options = options(dir, WIDE_DIM);
    options.l1_cache = CacheOptions::lru(1);
    options.runtime.num_shards = 1;
    options
}

pub fn zeros() -> InitializerOptions {
    InitializerOptions {
        kind: InitializerKind::Zeros,
        ..InitializerOptions::default()
    }
}

/// Switches shared by a [`FaultyDevice`] and the test driving it.
#[derive(Debug, Default)]
pub struct Faults {
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    read_stall_ms: AtomicU64,
    write_stall_ms: AtomicU64,
}

impl Faults {
    pub fn fail_reads(&self, on: bool) {
        self.fail_reads.store(on, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, on: bool) {
        self.fail_writes.store(on, Ordering::SeqCst);
    }

    pub fn stall_reads(&self, stall: Duration) {
        self.read_stall_ms
            .store(stall.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn stall_writes(&self, stall: Duration) {
        self.write_stall_ms
            .store(stall.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.fail_reads(false);
        self.fail_writes(false);
        self.stall_reads(Duration::ZERO);
        self.stall_writes(Duration::ZERO);
    }
}

/// An in-memory device that fails or stalls on command.
#[derive(Debug)]
pub struct FaultyDevice {
    inner: MemoryBlockDevice,
    faults: Arc<Faults>,
}

impl FaultyDevice {
    pub fn new(block_size: usize) -> (Arc<Self>, Arc<Faults>) {
        let faults = Arc::new(Faults::default());
        let device = Arc::new(Self {
            inner: MemoryBlockDevice::new(block_size),
            faults: Arc::clone(&faults),
        });
        (device, faults)
    }

    fn injected(what: &str) -> EmbeddingError {
        EmbeddingError::storage(
            what,
            io::Error::new(io::ErrorKind::Other, "injected device failure"),
        )
    }
}

impl BlockDevice for FaultyDevice {
    fn block_size(&self) -> usize {
        self.inner.block_size()
    }

    fn num_blocks(&self) -> u64 {
        self.inner.num_blocks()
    }

    fn read_blocks(&self, first: u64, count: usize) -> Result<Vec<u8>> {
        let stall = self.faults.read_stall_ms.load(Ordering::SeqCst);
        if stall > 0 {
            std::thread::sleep(Duration::from_millis(stall));
        }
        if self.faults.fail_reads.load(Ordering::SeqCst) {
            return Err(Self::injected("reading blocks"));
        }
        self.inner.read_blocks(first, count)
    }

    fn write_blocks(&self, first: u64, data: &[u8]) -> Result<()> {
        let stall = self.faults.write_stall_ms.load(Ordering::SeqCst);
        if stall > 0 {
            std::thread::sleep(Duration::from_millis(stall));
        }
        if self.faults.fail_writes.load(Ordering::SeqCst) {
            return Err(Self::injected("writing blocks"));
        }
        self.inner.write_blocks(first, data)
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}
