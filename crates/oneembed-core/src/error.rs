//! Error types for the embedding engine.
//!
//! Construction-time errors ([`EmbeddingError::Configuration`],
//! [`EmbeddingError::Capacity`]) abort engine startup. Everything else fails
//! the batch that raised it and is surfaced to the caller.

use std::time::Duration;

use thiserror::Error;

use crate::key::Key;

/// Cache or storage level named in capacity errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TierKind {
    /// The hot in-memory cache.
    L1,
    /// The optional second in-memory cache.
    L2,
    /// The persistent block-structured table.
    FixedTable,
}

impl std::fmt::Display for TierKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TierKind::L1 => write!(f, "l1_cache"),
            TierKind::L2 => write!(f, "l2_cache"),
            TierKind::FixedTable => write!(f, "fixed_table"),
        }
    }
}

/// The main error type for embedding engine operations.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// A required option is missing or malformed.
    #[error("configuration error: {message}")]
    Configuration {
        /// A description of the configuration problem.
        message: String,
    },

    /// A cache budget cannot hold even a single record.
    #[error(
        "{tier} budget of {budget_bytes} bytes is below one record footprint ({record_bytes} bytes)"
    )]
    Capacity {
        /// The tier whose budget is too small.
        tier: TierKind,
        /// The configured budget in bytes.
        budget_bytes: u64,
        /// Bytes needed by a single record.
        record_bytes: u64,
    },

    /// Reading or writing the fixed table failed.
    #[error("storage I/O error while {context}: {source}")]
    StorageIo {
        /// What the table was doing when the failure happened.
        context: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Fixed-table I/O did not complete within the configured timeout.
    #[error("fixed table I/O stalled: {elapsed:?} elapsed, limit {limit:?}")]
    Timeout {
        /// Time spent in the batch when the stall was detected.
        elapsed: Duration,
        /// The configured limit.
        limit: Duration,
    },

    /// Tier state for a key diverged and could not be repaired by reloading.
    #[error("key {key} has inconsistent tier state: {message}")]
    KeyConsistency {
        /// The affected key.
        key: Key,
        /// What was inconsistent.
        message: String,
    },

    /// A vector had the wrong width.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Expected number of values.
        expected: usize,
        /// Actual number of values provided.
        actual: usize,
    },

    /// The number of ids doesn't match the number of rows supplied.
    #[error("id count ({ids}) doesn't match row count ({rows})")]
    CountMismatch {
        /// Number of ids provided.
        ids: usize,
        /// Number of rows provided.
        rows: usize,
    },

    /// A checked update observed a record that changed after its lookup.
    #[error("stale update for key {key}: looked up version {observed}, current version {current}")]
    StaleUpdate {
        /// The key whose record moved on.
        key: Key,
        /// Version returned by the lookup.
        observed: u64,
        /// Version currently stored.
        current: u64,
    },
}

impl EmbeddingError {
    /// Shorthand for a [`EmbeddingError::Configuration`] error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Wraps an I/O error with the operation that produced it.
    pub fn storage(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::StorageIo {
            context: context.into(),
            source,
        }
    }

    /// Returns `true` for errors that can only happen while constructing an engine.
    pub fn is_construction_error(&self) -> bool {
        matches!(self, Self::Configuration { .. } | Self::Capacity { .. })
    }
}

/// A specialized Result type for embedding engine operations.
pub type Result<T> = std::result::Result<T, EmbeddingError>;
