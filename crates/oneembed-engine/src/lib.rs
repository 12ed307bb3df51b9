//! Tiered embedding lookup and update.
//!
//! [`EmbeddingEngine`] ties the pieces together: an L1 cache, an optional L2
//! cache, and the persistent fixed table, with per-key initialization on
//! first lookup and per-key optimizer steps on update.
//!
//! # Example
//!
//! ```no_run
//! use oneembed_core::{CacheOptions, EmbeddingOptions};
//! use oneembed_engine::EmbeddingEngine;
//!
//! fn main() -> oneembed_core::Result<()> {
//!     let mut options = EmbeddingOptions::new("item", 8, "/tmp/item_table");
//!     options.l1_cache = CacheOptions::lru(256);
//!
//!     let engine = EmbeddingEngine::open(options)?;
//!     let rows = engine.lookup(&[1, 2, 3])?;
//!     engine.apply_gradient_checked(&rows, &vec![0.01; rows.values().len()])?;
//!
//!     println!("{}", engine.stats());
//!     engine.close()
//! }
//! ```

mod engine;
mod output;
mod stats;

pub use engine::EmbeddingEngine;
pub use output::{Embeddings, TypedEmbeddings};
pub use stats::StatsSnapshot;
