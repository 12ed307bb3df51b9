//! Core types for the tiered embedding engine.
//!
//! This crate provides the pieces every other engine crate shares:
//!
//! - **Configuration**: The strongly-typed options blob ([`EmbeddingOptions`])
//! - **Errors**: The engine-wide error taxonomy ([`EmbeddingError`])
//! - **Keys**: Normalized row identifiers ([`Key`])
//!
//! # Example
//!
//! ```
//! use oneembed_core::{EmbeddingOptions, Key};
//!
//! let options = EmbeddingOptions::new("user", 64, "/tmp/user_table");
//! options.validate().unwrap();
//!
//! let key = Key::from_id(12345);
//! assert_eq!(key.to_id(), 12345);
//! ```

pub mod config;
pub mod error;
pub mod key;

pub use config::{
    CacheOptions, CachePolicy, DataType, DecayKind, DecayOptions, EmbeddingOptions,
    FixedTableOptions, InitializerKind, InitializerOptions, LearningRateScheduleOptions,
    OptimizerKind, OptimizerOptions, RuntimeOptions, WarmupKind, WarmupOptions,
};
pub use error::{EmbeddingError, Result, TierKind};
pub use key::{FeatureId, Key};
