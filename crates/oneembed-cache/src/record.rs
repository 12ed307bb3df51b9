//! Embedding records and their on-disk encoding.

use oneembed_core::{EmbeddingError, Key, OptimizerKind, Result};
use oneembed_optimizer::{OptimizerState, StateShape};

const F32_BYTES: usize = std::mem::size_of::<f32>();

/// Bytes in the fixed record header.
pub const HEADER_BYTES: usize = 32;

const FLAG_OCCUPIED: u32 = 1;

/// One embedding row with its optimizer state.
///
/// A record is owned by exactly one tier at a time; moving it between tiers
/// moves the value.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingRecord {
    /// The row's key.
    pub key: Key,
    /// The embedding vector.
    pub embedding: Vec<f32>,
    /// Optimizer state for this key.
    pub state: OptimizerState,
    /// Access generation assigned by the tier holding the record.
    pub generation: u64,
    /// Number of updates applied to this key since it was initialized.
    pub version: u64,
    /// Whether the record has updates the fixed table hasn't seen.
    pub dirty: bool,
}

impl EmbeddingRecord {
    /// Creates a record for a freshly initialized key.
    ///
    /// New records start dirty: the key has no representation in the fixed
    /// table yet.
    pub fn new(key: Key, embedding: Vec<f32>, state: OptimizerState) -> Self {
        Self {
            key,
            embedding,
            state,
            generation: 0,
            version: 0,
            dirty: true,
        }
    }

    /// Returns the embedding dimension.
    pub fn dim(&self) -> usize {
        self.embedding.len()
    }

    /// Returns the memory footprint of the record's values and state.
    pub fn memory_size(&self) -> usize {
        self.embedding.len() * F32_BYTES + self.state.memory_size()
    }
}

/// Fixed-width byte layout shared by every record of one table.
///
/// ```text
/// 0..8    key (u64 LE)
/// 8..12   flags (u32 LE, bit 0 = occupied)
/// 12..16  dim (u32 LE)
/// 16..24  version (u64 LE)
/// 24..32  optimizer step (u64 LE)
/// 32..    embedding, then each optimizer state vector (f32 LE)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLayout {
    dim: usize,
    optimizer: OptimizerKind,
}

impl RecordLayout {
    /// Creates the layout for `dim`-wide rows updated by `optimizer`.
    pub fn new(dim: usize, optimizer: OptimizerKind) -> Self {
        Self { dim, optimizer }
    }

    /// Returns the embedding dimension.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Returns the optimizer whose state the layout carries.
    pub fn optimizer(&self) -> OptimizerKind {
        self.optimizer
    }

    /// Returns the optimizer state shape.
    pub fn state_shape(&self) -> StateShape {
        StateShape::of(self.optimizer)
    }

    /// In-memory bytes charged against a cache budget for one record.
    pub fn footprint(&self) -> u64 {
        (self.dim * F32_BYTES + self.state_shape().bytes(self.dim)) as u64
    }

    /// Bytes one record occupies in the fixed table.
    pub fn encoded_len(&self) -> usize {
        HEADER_BYTES + (1 + self.state_shape().vectors) * self.dim * F32_BYTES
    }

    /// Encodes `record` into `out`, which must be `encoded_len()` bytes.
    pub fn encode(&self, record: &EmbeddingRecord, out: &mut [u8]) -> Result<()> {
        if record.dim() != self.dim {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.dim,
                actual: record.dim(),
            });
        }
        if !record.state.matches(self.optimizer, self.dim) {
            return Err(EmbeddingError::KeyConsistency {
                key: record.key,
                message: format!("optimizer state doesn't match {}", self.optimizer.name()),
            });
        }
        if out.len() != self.encoded_len() {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.encoded_len(),
                actual: out.len(),
            });
        }

        out[0..8].copy_from_slice(&record.key.raw().to_le_bytes());
        out[8..12].copy_from_slice(&FLAG_OCCUPIED.to_le_bytes());
        out[12..16].copy_from_slice(&(self.dim as u32).to_le_bytes());
        out[16..24].copy_from_slice(&record.version.to_le_bytes());
        out[24..32].copy_from_slice(&record.state.step().to_le_bytes());

        let values = std::iter::once(record.embedding.as_slice())
            .chain(record.state.vectors())
            .flat_map(|v| v.iter());
        for (chunk, value) in out[HEADER_BYTES..]
            .chunks_exact_mut(F32_BYTES)
            .zip(values)
        {
            chunk.copy_from_slice(&value.to_le_bytes());
        }
        Ok(())
    }

    /// Encodes `record` into a fresh buffer.
    pub fn encode_to_vec(&self, record: &EmbeddingRecord) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.encoded_len()];
        self.encode(record, &mut out)?;
        Ok(out)
    }

    /// Returns the key stored in an encoded slot, or `None` for an empty slot.
    pub fn peek_key(&self, bytes: &[u8]) -> Option<Key> {
        if bytes.len() < HEADER_BYTES || read_u32(bytes, 8) & FLAG_OCCUPIED == 0 {
            return None;
        }
        Some(Key::from_raw(read_u64(bytes, 0)))
    }

    /// Decodes one slot. Returns `Ok(None)` for an empty slot.
    ///
    /// The returned record is clean and carries generation 0.
    pub fn decode(&self, bytes: &[u8]) -> Result<Option<EmbeddingRecord>> {
        let Some(key) = self.peek_key(bytes) else {
            return Ok(None);
        };
        if bytes.len() != self.encoded_len() {
            return Err(EmbeddingError::KeyConsistency {
                key,
                message: format!(
                    "slot holds {} bytes, layout needs {}",
                    bytes.len(),
                    self.encoded_len()
                ),
            });
        }
        let stored_dim = read_u32(bytes, 12) as usize;
        if stored_dim != self.dim {
            return Err(EmbeddingError::KeyConsistency {
                key,
                message: format!("stored dim {stored_dim}, table dim {}", self.dim),
            });
        }
        let version = read_u64(bytes, 16);
        let step = read_u64(bytes, 24);

        let mut vectors = bytes[HEADER_BYTES..]
            .chunks_exact(self.dim * F32_BYTES)
            .map(|v| {
                v.chunks_exact(F32_BYTES)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect::<Vec<f32>>()
            })
            .collect::<Vec<_>>();
        if vectors.is_empty() {
            return Err(EmbeddingError::KeyConsistency {
                key,
                message: "slot has no embedding values".to_string(),
            });
        }
        let embedding = vectors.remove(0);
        let state = OptimizerState::from_parts(self.optimizer, vectors, step).ok_or_else(|| {
            EmbeddingError::KeyConsistency {
                key,
                message: "optimizer state vectors don't match layout".to_string(),
            }
        })?;

        Ok(Some(EmbeddingRecord {
            key,
            embedding,
            state,
            generation: 0,
            version,
            dirty: false,
        }))
    }
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(buf)
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adam_record() -> EmbeddingRecord {
        let mut record = EmbeddingRecord::new(
            Key::from_id(-42),
            vec![0.5, -1.5, 2.0],
            OptimizerState::Adam {
                m: vec![0.1, 0.2, 0.3],
                v: vec![0.01, 0.02, 0.03],
                t: 9,
            },
        );
        record.version = 4;
        record
    }

    #[test]
    fn test_footprint_matches_sgd_example() {
        let layout = RecordLayout::new(128, OptimizerKind::Sgd);
        assert_eq!(layout.footprint(), 512);
        assert_eq!(layout.encoded_len(), 32 + 512);
        assert_eq!(8192 * 1024 * 1024 / layout.footprint(), 16_777_216);
    }

    #[test]
    fn test_encode_decode_preserves_state() {
        let layout = RecordLayout::new(3, OptimizerKind::Adam);
        let record = adam_record();
        let bytes = layout.encode_to_vec(&record).unwrap();
        assert_eq!(bytes.len(), layout.encoded_len());
        assert_eq!(layout.peek_key(&bytes), Some(record.key));

        let decoded = layout.decode(&bytes).unwrap().unwrap();
        assert_eq!(decoded.key, record.key);
        assert_eq!(decoded.embedding, record.embedding);
        assert_eq!(decoded.state, record.state);
        assert_eq!(decoded.version, 4);
        assert!(!decoded.dirty);
    }

    #[test]
    fn test_empty_slot_decodes_to_none() {
        let layout = RecordLayout::new(3, OptimizerKind::Sgd);
        let bytes = vec![0u8; layout.encoded_len()];
        assert!(layout.decode(&bytes).unwrap().is_none());
        assert!(layout.peek_key(&bytes).is_none());
    }

    #[test]
    fn test_encode_rejects_wrong_shapes() {
        let layout = RecordLayout::new(4, OptimizerKind::Adam);
        let err = layout.encode_to_vec(&adam_record()).unwrap_err();
        assert!(matches!(err, EmbeddingError::DimensionMismatch { .. }));

        let layout = RecordLayout::new(3, OptimizerKind::Momentum);
        let err = layout.encode_to_vec(&adam_record()).unwrap_err();
        assert!(matches!(err, EmbeddingError::KeyConsistency { .. }));
    }

    #[test]
    fn test_decode_rejects_foreign_dim() {
        let written = RecordLayout::new(3, OptimizerKind::Sgd);
        let record = EmbeddingRecord::new(Key::from_id(1), vec![1.0; 3], OptimizerState::None);
        let mut bytes = written.encode_to_vec(&record).unwrap();
        bytes[12..16].copy_from_slice(&5u32.to_le_bytes());
        let err = written.decode(&bytes).unwrap_err();
        assert!(err.to_string().contains("stored dim 5"));
    }
}
