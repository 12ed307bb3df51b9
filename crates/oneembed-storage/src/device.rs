//! Block devices backing the fixed table.
//!
//! A device is a flat array of `block_size`-byte blocks. Blocks that were
//! never written read back as zeros.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hashbrown::HashMap;
use oneembed_core::{EmbeddingError, Result};
use parking_lot::{Mutex, RwLock};

/// Fixed-size block storage.
pub trait BlockDevice: Send + Sync {
    /// Size of one block in bytes.
    fn block_size(&self) -> usize;

    /// Number of blocks currently allocated.
    fn num_blocks(&self) -> u64;

    /// Reads `count` consecutive blocks starting at `first`.
    fn read_blocks(&self, first: u64, count: usize) -> Result<Vec<u8>>;

    /// Writes whole blocks starting at `first`. `data` must be a multiple of
    /// the block size.
    fn write_blocks(&self, first: u64, data: &[u8]) -> Result<()>;

    /// Flushes written blocks to durable storage.
    fn sync(&self) -> Result<()>;

    /// Reads one block.
    fn read_block(&self, block_id: u64) -> Result<Vec<u8>> {
        self.read_blocks(block_id, 1)
    }

    /// Writes one block.
    fn write_block(&self, block_id: u64, data: &[u8]) -> Result<()> {
        if data.len() != self.block_size() {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.block_size(),
                actual: data.len(),
            });
        }
        self.write_blocks(block_id, data)
    }
}

impl<T: BlockDevice + ?Sized> BlockDevice for Arc<T> {
    fn block_size(&self) -> usize {
        (**self).block_size()
    }

    fn num_blocks(&self) -> u64 {
        (**self).num_blocks()
    }

    fn read_blocks(&self, first: u64, count: usize) -> Result<Vec<u8>> {
        (**self).read_blocks(first, count)
    }

    fn write_blocks(&self, first: u64, data: &[u8]) -> Result<()> {
        (**self).write_blocks(first, data)
    }

    fn sync(&self) -> Result<()> {
        (**self).sync()
    }
}

fn check_whole_blocks(data: &[u8], block_size: usize) -> Result<()> {
    if data.is_empty() || data.len() % block_size != 0 {
        return Err(EmbeddingError::DimensionMismatch {
            expected: block_size * (data.len() / block_size).max(1),
            actual: data.len(),
        });
    }
    Ok(())
}

/// A device made of preallocated chunk files in one directory.
///
/// Block `b` lives in chunk file `b / blocks_per_chunk` at byte offset
/// `(b % blocks_per_chunk) * block_size`. Chunk files are created on first
/// write and sized to `chunk_size` up front.
#[derive(Debug)]
pub struct FileBlockDevice {
    dir: PathBuf,
    block_size: usize,
    chunk_size: u64,
    chunks: RwLock<Vec<Mutex<File>>>,
}

impl FileBlockDevice {
    /// Opens the device in `dir`, picking up existing chunk files.
    pub fn open(dir: impl AsRef<Path>, block_size: u64, chunk_size: u64) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        if block_size == 0 || chunk_size % block_size != 0 {
            return Err(EmbeddingError::config(format!(
                "chunk_size ({chunk_size}) must be a multiple of block_size ({block_size})"
            )));
        }
        std::fs::create_dir_all(&dir).map_err(|e| {
            EmbeddingError::storage(format!("creating table directory {}", dir.display()), e)
        })?;

        let mut chunks = Vec::new();
        loop {
            let path = Self::chunk_path(&dir, chunks.len());
            if !path.exists() {
                break;
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)
                .map_err(|e| {
                    EmbeddingError::storage(format!("opening chunk {}", path.display()), e)
                })?;
            chunks.push(Mutex::new(file));
        }

        tracing::debug!(
            path = %dir.display(),
            chunks = chunks.len(),
            block_size,
            chunk_size,
            "Opened block device"
        );

        Ok(Self {
            dir,
            block_size: usize::try_from(block_size)
                .map_err(|_| EmbeddingError::config("block_size does not fit in memory"))?,
            chunk_size,
            chunks: RwLock::new(chunks),
        })
    }

    /// Path of chunk file `index`.
    pub fn chunk_path(dir: &Path, index: usize) -> PathBuf {
        dir.join(format!("values-{index:06}.chunk"))
    }

    /// Directory holding the chunk files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn blocks_per_chunk(&self) -> u64 {
        self.chunk_size / self.block_size as u64
    }

    fn ensure_chunks(&self, count: usize) -> Result<()> {
        if self.chunks.read().len() >= count {
            return Ok(());
        }
        let mut chunks = self.chunks.write();
        while chunks.len() < count {
            let path = Self::chunk_path(&self.dir, chunks.len());
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .map_err(|e| {
                    EmbeddingError::storage(format!("creating chunk {}", path.display()), e)
                })?;
            file.set_len(self.chunk_size).map_err(|e| {
                EmbeddingError::storage(format!("allocating chunk {}", path.display()), e)
            })?;
            tracing::debug!(path = %path.display(), "Allocated chunk");
            chunks.push(Mutex::new(file));
        }
        Ok(())
    }

    /// Splits a block range into per-chunk `(chunk, byte offset, blocks)` runs.
    fn segments(&self, first: u64, count: u64) -> Vec<(usize, u64, u64)> {
        let per_chunk = self.blocks_per_chunk();
        let mut segments = Vec::new();
        let mut block = first;
        let end = first + count;
        while block < end {
            let chunk = block / per_chunk;
            let within = block % per_chunk;
            let run = (per_chunk - within).min(end - block);
            segments.push((chunk as usize, within * self.block_size as u64, run));
            block += run;
        }
        segments
    }
}

impl BlockDevice for FileBlockDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn num_blocks(&self) -> u64 {
        self.chunks.read().len() as u64 * self.blocks_per_chunk()
    }

    fn read_blocks(&self, first: u64, count: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; count * self.block_size];
        let chunks = self.chunks.read();
        let mut cursor = 0usize;
        for (chunk, offset, run) in self.segments(first, count as u64) {
            let len = run as usize * self.block_size;
            if let Some(file) = chunks.get(chunk) {
                let mut file = file.lock();
                file.seek(SeekFrom::Start(offset))
                    .and_then(|_| file.read_exact(&mut out[cursor..cursor + len]))
                    .map_err(|e| {
                        EmbeddingError::storage(
                            format!("reading {run} blocks from chunk {chunk} at {offset}"),
                            e,
                        )
                    })?;
            }
            cursor += len;
        }
        Ok(out)
    }

    fn write_blocks(&self, first: u64, data: &[u8]) -> Result<()> {
        check_whole_blocks(data, self.block_size)?;
        let count = (data.len() / self.block_size) as u64;
        let last_chunk = (first + count - 1) / self.blocks_per_chunk();
        self.ensure_chunks(last_chunk as usize + 1)?;

        let chunks = self.chunks.read();
        let mut cursor = 0usize;
        for (chunk, offset, run) in self.segments(first, count) {
            let len = run as usize * self.block_size;
            let Some(file) = chunks.get(chunk) else {
                return Err(EmbeddingError::storage(
                    format!("writing chunk {chunk}"),
                    std::io::Error::new(std::io::ErrorKind::NotFound, "chunk not allocated"),
                ));
            };
            let mut file = file.lock();
            file.seek(SeekFrom::Start(offset))
                .and_then(|_| file.write_all(&data[cursor..cursor + len]))
                .map_err(|e| {
                    EmbeddingError::storage(
                        format!("writing {run} blocks to chunk {chunk} at {offset}"),
                        e,
                    )
                })?;
            cursor += len;
        }
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        for (index, file) in self.chunks.read().iter().enumerate() {
            file.lock()
                .sync_data()
                .map_err(|e| EmbeddingError::storage(format!("syncing chunk {index}"), e))?;
        }
        Ok(())
    }
}

/// A volatile device keeping blocks in memory.
#[derive(Debug)]
pub struct MemoryBlockDevice {
    block_size: usize,
    blocks: RwLock<HashMap<u64, Vec<u8>>>,
}

impl MemoryBlockDevice {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            blocks: RwLock::new(HashMap::new()),
        }
    }
}

impl BlockDevice for MemoryBlockDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn num_blocks(&self) -> u64 {
        self.blocks.read().keys().max().map_or(0, |max| max + 1)
    }

    fn read_blocks(&self, first: u64, count: usize) -> Result<Vec<u8>> {
        let blocks = self.blocks.read();
        let mut out = Vec::with_capacity(count * self.block_size);
        for block_id in first..first + count as u64 {
            match blocks.get(&block_id) {
                Some(block) => out.extend_from_slice(block),
                None => out.resize(out.len() + self.block_size, 0),
            }
        }
        Ok(out)
    }

    fn write_blocks(&self, first: u64, data: &[u8]) -> Result<()> {
        check_whole_blocks(data, self.block_size)?;
        let mut blocks = self.blocks.write();
        for (i, block) in data.chunks_exact(self.block_size).enumerate() {
            blocks.insert(first + i as u64, block.to_vec());
        }
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}
