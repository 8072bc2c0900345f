//! Shoebox Catalog - durable record store for the reorganization pipeline
//!
//! A single embedded SQLite database holds file records, folder records,
//! aggregate hashes, classification outcomes, and the emitted plan.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌────────────┐
//! │ Scanner  │   │  Hasher  │   │ Classifier │   producers (enqueue,
//! └────┬─────┘   └────┬─────┘   └─────┬──────┘   block when full)
//!      └──────────────┼───────────────┘
//!                ┌────▼─────┐
//!                │  writer  │  single thread, batched transactions
//!                └────┬─────┘
//!                ┌────▼─────┐
//!                │  SQLite  │  readers see the last committed batch
//!                └──────────┘
//! ```

pub mod error;
pub mod store;
pub mod types;
pub mod writer;

pub use error::{CatalogError, Result};
pub use store::{Catalog, SCHEMA_VERSION};
pub use types::{
    basename, normalize_path, parent_path, path_depth, DecisionSource, DuplicateGroup, FileRecord,
    FileStatus, FolderAction, FolderRecord, PlanEntry, PlanOp,
};
pub use writer::{CatalogWriter, WriteOp, WriterHandle, WriterStats};
