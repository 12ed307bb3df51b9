//! Block-structured persistent storage for the embedding engine.
//!
//! This crate provides:
//!
//! - **Block devices**: [`BlockDevice`] over chunk files ([`FileBlockDevice`])
//!   or memory ([`MemoryBlockDevice`])
//! - **Fixed table**: [`FixedTable`], the durable key to record store
//! - **Metadata**: [`TableMeta`], the layout and progress saved as `meta.json`
//!
//! # Example
//!
//! ```no_run
//! use oneembed_cache::{EmbeddingRecord, RecordLayout};
//! use oneembed_core::{FixedTableOptions, Key, OptimizerKind};
//! use oneembed_optimizer::OptimizerState;
//! use oneembed_storage::FixedTable;
//!
//! fn main() -> oneembed_core::Result<()> {
//!     let layout = RecordLayout::new(16, OptimizerKind::Sgd);
//!     let table = FixedTable::open("user", &FixedTableOptions::at("/tmp/user_table"), layout)?;
//!
//!     let record = EmbeddingRecord::new(Key::from_id(1), vec![0.0; 16], OptimizerState::None);
//!     table.put(&record)?;
//!     table.checkpoint(0)?;
//!
//!     assert!(table.get(Key::from_id(1))?.is_some());
//!     Ok(())
//! }
//! ```

mod device;
mod meta;
mod table;

pub use device::{BlockDevice, FileBlockDevice, MemoryBlockDevice};
pub use meta::{TableMeta, META_FILE};
pub use table::FixedTable;
