//! Lookup results.

use half::f16;
use oneembed_core::{DataType, Key};

/// Rows returned by a lookup, in input order.
///
/// Duplicate ids produce repeated rows. Each row carries the version of its
/// record at lookup time so a later update can be checked against it.
#[derive(Debug, Clone, PartialEq)]
pub struct Embeddings {
    keys: Vec<Key>,
    versions: Vec<u64>,
    values: Vec<f32>,
    dim: usize,
}

impl Embeddings {
    pub(crate) fn new(keys: Vec<Key>, versions: Vec<u64>, values: Vec<f32>, dim: usize) -> Self {
        debug_assert_eq!(keys.len(), versions.len());
        debug_assert_eq!(keys.len() * dim, values.len());
        Self {
            keys,
            versions,
            values,
            dim,
        }
    }

    pub(crate) fn empty(dim: usize) -> Self {
        Self::new(Vec::new(), Vec::new(), Vec::new(), dim)
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Width of each row.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Key of every row.
    pub fn keys(&self) -> &[Key] {
        &self.keys
    }

    /// Record version of every row.
    pub fn versions(&self) -> &[u64] {
        &self.versions
    }

    /// Row `index`, or `None` if out of range.
    pub fn row(&self, index: usize) -> Option<&[f32]> {
        let start = index.checked_mul(self.dim)?;
        self.values.get(start..start + self.dim)
    }

    /// Iterates over rows in input order.
    pub fn rows(&self) -> impl Iterator<Item = &[f32]> {
        self.values.chunks_exact(self.dim.max(1))
    }

    /// The `[len, dim]` row-major buffer.
    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Consumes the result and returns the row-major buffer.
    pub fn into_values(self) -> Vec<f32> {
        self.values
    }

    /// Converts the buffer to `dtype`.
    pub fn to_typed(&self, dtype: DataType) -> TypedEmbeddings {
        match dtype {
            DataType::Float32 => TypedEmbeddings::Float32(self.values.clone()),
            DataType::Float16 => {
                TypedEmbeddings::Float16(self.values.iter().map(|&v| f16::from_f32(v)).collect())
            }
        }
    }
}

/// A lookup buffer in the configured output element type.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedEmbeddings {
    /// 32-bit values.
    Float32(Vec<f32>),
    /// 16-bit values.
    Float16(Vec<f16>),
}

impl TypedEmbeddings {
    /// Element type of the buffer.
    pub fn dtype(&self) -> DataType {
        match self {
            TypedEmbeddings::Float32(_) => DataType::Float32,
            TypedEmbeddings::Float16(_) => DataType::Float16,
        }
    }

    /// Number of scalar values.
    pub fn len(&self) -> usize {
        match self {
            TypedEmbeddings::Float32(values) => values.len(),
            TypedEmbeddings::Float16(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Widens the buffer back to `f32`.
    pub fn to_f32(&self) -> Vec<f32> {
        match self {
            TypedEmbeddings::Float32(values) => values.clone(),
            TypedEmbeddings::Float16(values) => values.iter().map(|v| v.to_f32()).collect(),
        }
    }
}
