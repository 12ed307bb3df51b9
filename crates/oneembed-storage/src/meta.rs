//! Table metadata persisted next to the chunk files.

use std::path::{Path, PathBuf};

use oneembed_core::{EmbeddingError, OptimizerKind, Result};
use serde::{Deserialize, Serialize};

/// Name of the metadata file inside a table directory.
pub const META_FILE: &str = "meta.json";

const FORMAT_VERSION: u32 = 1;

/// Layout and progress of a fixed table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMeta {
    /// On-disk format revision.
    pub format_version: u32,
    /// Table name.
    pub embedding_name: String,
    /// Width of every stored vector.
    pub embedding_size: usize,
    /// Optimizer whose state is stored with each row.
    pub optimizer: OptimizerKind,
    /// Encoded bytes per row.
    pub record_bytes: usize,
    /// Block size in bytes.
    pub block_size: u64,
    /// Chunk file size in bytes.
    pub chunk_size: u64,
    /// Rows allocated at the last checkpoint.
    pub rows: u64,
    /// Schedule step at the last checkpoint.
    pub last_step: u64,
}

impl TableMeta {
    /// Metadata for a new, empty table.
    pub fn new(
        embedding_name: impl Into<String>,
        embedding_size: usize,
        optimizer: OptimizerKind,
        record_bytes: usize,
        block_size: u64,
        chunk_size: u64,
    ) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            embedding_name: embedding_name.into(),
            embedding_size,
            optimizer,
            record_bytes,
            block_size,
            chunk_size,
            rows: 0,
            last_step: 0,
        }
    }

    /// Path of the metadata file in `dir`.
    pub fn path(dir: &Path) -> PathBuf {
        dir.join(META_FILE)
    }

    /// Loads metadata from `dir`, or `None` if the table is new.
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let path = Self::path(dir);
        if !path.exists() {
            return Ok(None);
        }
        let json = std::fs::read_to_string(&path)
            .map_err(|e| EmbeddingError::storage(format!("reading {}", path.display()), e))?;
        let meta: Self = serde_json::from_str(&json).map_err(|e| {
            EmbeddingError::config(format!("malformed table metadata {}: {e}", path.display()))
        })?;
        if meta.format_version != FORMAT_VERSION {
            return Err(EmbeddingError::config(format!(
                "unsupported table format {} in {}",
                meta.format_version,
                path.display()
            )));
        }
        Ok(Some(meta))
    }

    /// Writes metadata to `dir` atomically.
    pub fn store(&self, dir: &Path) -> Result<()> {
        let path = Self::path(dir);
        let tmp = dir.join(format!("{META_FILE}.tmp"));
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| EmbeddingError::config(format!("cannot serialize table metadata: {e}")))?;
        std::fs::write(&tmp, json)
            .and_then(|_| std::fs::rename(&tmp, &path))
            .map_err(|e| EmbeddingError::storage(format!("writing {}", path.display()), e))?;
        tracing::debug!(path = %path.display(), rows = self.rows, step = self.last_step, "Table metadata saved");
        Ok(())
    }

    /// Checks that an existing table was written with the same layout.
    pub fn check_compatible(&self, expected: &TableMeta) -> Result<()> {
        let mismatch = |field: &str, found: String, wanted: String| {
            EmbeddingError::config(format!(
                "table {} was written with {field} {found}, options ask for {wanted}",
                self.embedding_name
            ))
        };
        if self.embedding_size != expected.embedding_size {
            return Err(mismatch(
                "embedding_size",
                self.embedding_size.to_string(),
                expected.embedding_size.to_string(),
            ));
        }
        if self.optimizer != expected.optimizer {
            return Err(mismatch(
                "optimizer",
                self.optimizer.name().to_string(),
                expected.optimizer.name().to_string(),
            ));
        }
        if self.block_size != expected.block_size {
            return Err(mismatch(
                "block_size",
                self.block_size.to_string(),
                expected.block_size.to_string(),
            ));
        }
        if self.chunk_size != expected.chunk_size {
            return Err(mismatch(
                "chunk_size",
                self.chunk_size.to_string(),
                expected.chunk_size.to_string(),
            ));
        }
        if self.record_bytes != expected.record_bytes {
            return Err(mismatch(
                "record_bytes",
                self.record_bytes.to_string(),
                expected.record_bytes.to_string(),
            ));
        }
        Ok(())
    }
}
