//! The fixed (persistent) table.
//!
//! Rows are appended in first-write order and never move. An in-memory index
//! maps each key to its row; every encoded row carries its key, so the index
//! is rebuilt by scanning the device when an existing table is reopened.
//!
//! Row placement depends on the encoded record size:
//!
//! - records no larger than a block are packed `block_size / record_len` per
//!   block and never straddle a block boundary
//! - larger records span `ceil(record_len / block_size)` whole blocks

use std::path::{Path, PathBuf};

use hashbrown::HashMap;
use oneembed_cache::{EmbeddingRecord, RecordLayout};
use oneembed_core::{EmbeddingError, FixedTableOptions, Key, Result};
use parking_lot::{Mutex, RwLock};

use crate::device::{BlockDevice, FileBlockDevice};
use crate::meta::TableMeta;

const BLOCK_LOCK_STRIPES: usize = 64;
const SCAN_BATCH_BLOCKS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    Packed { per_block: u64 },
    Spanning { blocks: u64 },
}

impl Placement {
    fn new(record_len: usize, block_size: usize) -> Self {
        if record_len <= block_size {
            Self::Packed {
                per_block: (block_size / record_len) as u64,
            }
        } else {
            Self::Spanning {
                blocks: record_len.div_ceil(block_size) as u64,
            }
        }
    }
}

#[derive(Debug, Default)]
struct RowIndex {
    rows: HashMap<Key, u64>,
    next_row: u64,
}

/// Block-structured durable store holding every initialized key.
pub struct FixedTable {
    name: String,
    dir: Option<PathBuf>,
    device: Box<dyn BlockDevice>,
    layout: RecordLayout,
    record_len: usize,
    block_size: usize,
    placement: Placement,
    index: RwLock<RowIndex>,
    block_locks: Vec<Mutex<()>>,
    meta: Mutex<TableMeta>,
}

impl std::fmt::Debug for FixedTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedTable")
            .field("name", &self.name)
            .field("dir", &self.dir)
            .field("layout", &self.layout)
            .field("placement", &self.placement)
            .field("rows", &self.len())
            .finish()
    }
}

impl FixedTable {
    /// Opens (or creates) the table in `options.path` on chunk files.
    pub fn open(name: &str, options: &FixedTableOptions, layout: RecordLayout) -> Result<Self> {
        let dir = options
            .path
            .as_deref()
            .ok_or_else(|| EmbeddingError::config("fixed_table.path is required"))?;
        let device = FileBlockDevice::open(dir, options.block_size, options.chunk_size)?;
        Self::open_with_device(name, options, layout, Box::new(device))
    }

    /// Opens the table on an explicit device.
    ///
    /// Metadata is kept in `options.path` when it is set.
    pub fn open_with_device(
        name: &str,
        options: &FixedTableOptions,
        layout: RecordLayout,
        device: Box<dyn BlockDevice>,
    ) -> Result<Self> {
        let block_size = device.block_size();
        if block_size as u64 != options.block_size {
            return Err(EmbeddingError::config(format!(
                "device block size {block_size} differs from fixed_table.block_size {}",
                options.block_size
            )));
        }
        let record_len = layout.encoded_len();
        let expected = TableMeta::new(
            name,
            layout.dim(),
            layout.optimizer(),
            record_len,
            options.block_size,
            options.chunk_size,
        );

        let dir = options.path.clone();
        let meta = match dir.as_deref() {
            Some(dir) => match TableMeta::load(dir)? {
                Some(stored) => {
                    stored.check_compatible(&expected)?;
                    stored
                }
                None => {
                    std::fs::create_dir_all(dir).map_err(|e| {
                        EmbeddingError::storage(format!("creating {}", dir.display()), e)
                    })?;
                    expected.store(dir)?;
                    expected
                }
            },
            None => expected,
        };

        let table = Self {
            name: name.to_string(),
            dir,
            device,
            layout,
            record_len,
            block_size,
            placement: Placement::new(record_len, block_size),
            index: RwLock::new(RowIndex::default()),
            block_locks: (0..BLOCK_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            meta: Mutex::new(meta),
        };
        table.rebuild_index()?;

        tracing::info!(
            embedding = %table.name,
            rows = table.len(),
            last_step = table.last_step(),
            record_bytes = record_len,
            block_size,
            "Opened fixed table"
        );
        Ok(table)
    }

    /// Opens an existing table using the layout recorded in its metadata.
    pub fn open_existing(dir: &Path) -> Result<Self> {
        let meta = TableMeta::load(dir)?.ok_or_else(|| {
            EmbeddingError::config(format!("{} has no table metadata", dir.display()))
        })?;
        let options = FixedTableOptions {
            path: Some(dir.to_path_buf()),
            block_size: meta.block_size,
            chunk_size: meta.chunk_size,
        };
        let layout = RecordLayout::new(meta.embedding_size, meta.optimizer);
        Self::open(&meta.embedding_name, &options, layout)
    }

    fn rebuild_index(&self) -> Result<()> {
        let total_blocks = self.device.num_blocks();
        let mut found: Vec<(Key, u64)> = Vec::new();

        match self.placement {
            Placement::Packed { per_block } => {
                let mut block = 0u64;
                while block < total_blocks {
                    let count = (total_blocks - block).min(SCAN_BATCH_BLOCKS as u64) as usize;
                    let data = self.device.read_blocks(block, count)?;
                    for (i, block_bytes) in data.chunks_exact(self.block_size).enumerate() {
                        for slot in 0..per_block as usize {
                            let start = slot * self.record_len;
                            let bytes = &block_bytes[start..start + self.record_len];
                            if let Some(key) = self.layout.peek_key(bytes) {
                                found.push((key, (block + i as u64) * per_block + slot as u64));
                            }
                        }
                    }
                    block += count as u64;
                }
            }
            Placement::Spanning { blocks } => {
                for row in 0..total_blocks / blocks {
                    let head = self.device.read_block(row * blocks)?;
                    if let Some(key) = self.layout.peek_key(&head) {
                        found.push((key, row));
                    }
                }
            }
        }

        let mut index = self.index.write();
        for (key, row) in found {
            if let Some(previous) = index.rows.insert(key, row) {
                tracing::warn!(
                    embedding = %self.name,
                    key = %key,
                    previous_row = previous,
                    row,
                    "Key stored in two rows; keeping the later one"
                );
            }
            index.next_row = index.next_row.max(row + 1);
        }
        Ok(())
    }

    fn slot_location(&self, row: u64) -> (u64, usize) {
        match self.placement {
            Placement::Packed { per_block } => (
                row / per_block,
                (row % per_block) as usize * self.record_len,
            ),
            Placement::Spanning { blocks } => (row * blocks, 0),
        }
    }

    fn read_slot(&self, row: u64) -> Result<Vec<u8>> {
        let (block, offset) = self.slot_location(row);
        match self.placement {
            Placement::Packed { .. } => {
                let data = self.device.read_block(block)?;
                Ok(data[offset..offset + self.record_len].to_vec())
            }
            Placement::Spanning { blocks } => {
                let mut data = self.device.read_blocks(block, blocks as usize)?;
                data.truncate(self.record_len);
                Ok(data)
            }
        }
    }

    fn write_slot(&self, row: u64, bytes: &[u8]) -> Result<()> {
        let (block, offset) = self.slot_location(row);
        match self.placement {
            Placement::Packed { .. } => {
                let _guard = self.block_locks[block as usize % BLOCK_LOCK_STRIPES].lock();
                let mut data = self.device.read_block(block)?;
                data[offset..offset + self.record_len].copy_from_slice(bytes);
                self.device.write_block(block, &data)
            }
            Placement::Spanning { blocks } => {
                let mut data = bytes.to_vec();
                data.resize(blocks as usize * self.block_size, 0);
                self.device.write_blocks(block, &data)
            }
        }
    }

    /// Reads the persisted record for `key`, or `None` if it was never written.
    pub fn get(&self, key: Key) -> Result<Option<EmbeddingRecord>> {
        let Some(row) = self.index.read().rows.get(&key).copied() else {
            return Ok(None);
        };
        let bytes = self.read_slot(row)?;
        match self.layout.decode(&bytes)? {
            Some(record) if record.key == key => Ok(Some(record)),
            Some(record) => Err(EmbeddingError::KeyConsistency {
                key,
                message: format!("row {row} holds key {}", record.key),
            }),
            None => Err(EmbeddingError::KeyConsistency {
                key,
                message: format!("indexed row {row} is empty"),
            }),
        }
    }

    /// Persists `record`, allocating a row on its first write.
    pub fn put(&self, record: &EmbeddingRecord) -> Result<()> {
        let bytes = self.layout.encode_to_vec(record)?;
        let (row, fresh) = {
            let mut index = self.index.write();
            match index.rows.get(&record.key) {
                Some(&row) => (row, false),
                None => {
                    let row = index.next_row;
                    index.next_row += 1;
                    index.rows.insert(record.key, row);
                    (row, true)
                }
            }
        };

        let result = self.write_slot(row, &bytes);
        if result.is_err() && fresh {
            self.index.write().rows.remove(&record.key);
        }
        result
    }

    /// Persists every record in order, stopping at the first failure.
    pub fn put_all<'a>(
        &self,
        records: impl IntoIterator<Item = &'a EmbeddingRecord>,
    ) -> Result<usize> {
        let mut written = 0;
        for record in records {
            self.put(record)?;
            written += 1;
        }
        Ok(written)
    }

    /// Syncs the device and records `step` as the last durable step.
    pub fn checkpoint(&self, step: u64) -> Result<()> {
        self.device.sync()?;
        let mut meta = self.meta.lock();
        meta.rows = self.index.read().next_row;
        meta.last_step = step;
        if let Some(dir) = &self.dir {
            meta.store(dir)?;
        }
        tracing::info!(
            embedding = %self.name,
            rows = meta.rows,
            step,
            "Fixed table checkpointed"
        );
        Ok(())
    }

    /// Returns `true` if `key` has a persisted row.
    pub fn contains(&self, key: Key) -> bool {
        self.index.read().rows.contains_key(&key)
    }

    /// Number of persisted keys.
    pub fn len(&self) -> usize {
        self.index.read().rows.len()
    }

    /// Returns `true` if no key has been persisted.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Schedule step recorded by the last checkpoint.
    pub fn last_step(&self) -> u64 {
        self.meta.lock().last_step
    }

    /// A copy of the table metadata.
    pub fn meta(&self) -> TableMeta {
        self.meta.lock().clone()
    }

    /// The record layout.
    pub fn layout(&self) -> RecordLayout {
        self.layout
    }

    /// Rows packed per block, or 0 when records span several blocks.
    pub fn records_per_block(&self) -> u64 {
        match self.placement {
            Placement::Packed { per_block } => per_block,
            Placement::Spanning { .. } => 0,
        }
    }

    /// Table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directory holding the table, if file backed.
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryBlockDevice;
    use oneembed_core::OptimizerKind;
    use oneembed_optimizer::OptimizerState;
    use tempfile::tempdir;

    fn options(path: Option<&Path>, block_size: u64) -> FixedTableOptions {
        FixedTableOptions {
            path: path.map(Path::to_path_buf),
            block_size,
            chunk_size: block_size * 8,
        }
    }

    fn record(id: i64, dim: usize) -> EmbeddingRecord {
        EmbeddingRecord::new(Key::from_id(id), vec![id as f32; dim], OptimizerState::None)
    }

    #[test]
    fn test_placement() {
        assert_eq!(
            Placement::new(544, 512),
            Placement::Spanning { blocks: 2 }
        );
        assert_eq!(Placement::new(48, 512), Placement::Packed { per_block: 10 });
        assert_eq!(Placement::new(512, 512), Placement::Packed { per_block: 1 });
    }

    #[test]
    fn test_packed_rows_round_trip() {
        let layout = RecordLayout::new(4, OptimizerKind::Sgd);
        let table = FixedTable::open_with_device(
            "t",
            &options(None, 128),
            layout,
            Box::new(MemoryBlockDevice::new(128)),
        )
        .unwrap();
        assert_eq!(table.records_per_block(), 2);

        for id in 0..5 {
            table.put(&record(id, 4)).unwrap();
        }
        assert_eq!(table.len(), 5);
        for id in 0..5 {
            let stored = table.get(Key::from_id(id)).unwrap().unwrap();
            assert_eq!(stored.embedding, vec![id as f32; 4]);
            assert!(!stored.dirty);
        }
        assert!(table.get(Key::from_id(99)).unwrap().is_none());
    }

    #[test]
    fn test_overwrite_keeps_row() {
        let layout = RecordLayout::new(4, OptimizerKind::Sgd);
        let table = FixedTable::open_with_device(
            "t",
            &options(None, 128),
            layout,
            Box::new(MemoryBlockDevice::new(128)),
        )
        .unwrap();

        table.put(&record(1, 4)).unwrap();
        table.put(&record(2, 4)).unwrap();
        let mut updated = record(1, 4);
        updated.embedding = vec![-1.0; 4];
        updated.version = 3;
        table.put(&updated).unwrap();

        assert_eq!(table.len(), 2);
        let stored = table.get(Key::from_id(1)).unwrap().unwrap();
        assert_eq!(stored.embedding, vec![-1.0; 4]);
        assert_eq!(stored.version, 3);
        assert_eq!(table.get(Key::from_id(2)).unwrap().unwrap().embedding, vec![2.0; 4]);
    }

    #[test]
    fn test_spanning_rows_round_trip() {
        let layout = RecordLayout::new(64, OptimizerKind::Adam);
        assert!(layout.encoded_len() > 128);
        let table = FixedTable::open_with_device(
            "t",
            &options(None, 128),
            layout,
            Box::new(MemoryBlockDevice::new(128)),
        )
        .unwrap();
        assert_eq!(table.records_per_block(), 0);

        let mut stored = EmbeddingRecord::new(
            Key::from_id(7),
            vec![0.5; 64],
            OptimizerState::zeroed(OptimizerKind::Adam, 64),
        );
        stored.version = 2;
        table.put(&stored).unwrap();
        table.put(&EmbeddingRecord::new(
            Key::from_id(8),
            vec![1.5; 64],
            OptimizerState::zeroed(OptimizerKind::Adam, 64),
        ))
        .unwrap();

        let loaded = table.get(Key::from_id(7)).unwrap().unwrap();
        assert_eq!(loaded.embedding, vec![0.5; 64]);
        assert_eq!(loaded.version, 2);
        assert_eq!(table.get(Key::from_id(8)).unwrap().unwrap().embedding, vec![1.5; 64]);
    }

    #[test]
    fn test_reopen_rebuilds_index() {
        let dir = tempdir().unwrap();
        let layout = RecordLayout::new(4, OptimizerKind::Sgd);
        {
            let table = FixedTable::open("t", &options(Some(dir.path()), 128), layout).unwrap();
            for id in [-3, 10, 11, 12] {
                table.put(&record(id, 4)).unwrap();
            }
            table.checkpoint(17).unwrap();
        }

        let table = FixedTable::open("t", &options(Some(dir.path()), 128), layout).unwrap();
        assert_eq!(table.len(), 4);
        assert_eq!(table.last_step(), 17);
        assert_eq!(table.meta().rows, 4);
        assert_eq!(
            table.get(Key::from_id(-3)).unwrap().unwrap().embedding,
            vec![-3.0; 4]
        );

        // New keys append after the recovered rows.
        table.put(&record(13, 4)).unwrap();
        assert_eq!(table.get(Key::from_id(12)).unwrap().unwrap().embedding, vec![12.0; 4]);
        assert_eq!(table.get(Key::from_id(13)).unwrap().unwrap().embedding, vec![13.0; 4]);
    }

    #[test]
    fn test_open_existing_uses_stored_layout() {
        let dir = tempdir().unwrap();
        let layout = RecordLayout::new(4, OptimizerKind::Momentum);
        {
            let table = FixedTable::open("user", &options(Some(dir.path()), 128), layout).unwrap();
            table
                .put(&EmbeddingRecord::new(
                    Key::from_id(1),
                    vec![1.0; 4],
                    OptimizerState::zeroed(OptimizerKind::Momentum, 4),
                ))
                .unwrap();
            table.checkpoint(1).unwrap();
        }

        let table = FixedTable::open_existing(dir.path()).unwrap();
        assert_eq!(table.name(), "user");
        assert_eq!(table.layout(), layout);
        assert!(table.contains(Key::from_id(1)));
    }

    #[test]
    fn test_reopen_with_other_layout_fails() {
        let dir = tempdir().unwrap();
        FixedTable::open(
            "t",
            &options(Some(dir.path()), 128),
            RecordLayout::new(4, OptimizerKind::Sgd),
        )
        .unwrap();

        let err = FixedTable::open(
            "t",
            &options(Some(dir.path()), 128),
            RecordLayout::new(8, OptimizerKind::Sgd),
        )
        .unwrap_err();
        assert!(err.is_construction_error(), "{err}");
    }

    #[test]
    fn test_device_block_size_must_match() {
        let err = FixedTable::open_with_device(
            "t",
            &options(None, 128),
            RecordLayout::new(4, OptimizerKind::Sgd),
            Box::new(MemoryBlockDevice::new(64)),
        )
        .unwrap_err();
        assert!(err.is_construction_error());
    }
}
