//! Error types for the catalog store.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Catalog error type
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(
        "Catalog schema version mismatch at {path}: found v{found}, expected v{expected}. \
         Move the catalog aside or point DB_PATH at a fresh location."
    )]
    VersionMismatch {
        path: PathBuf,
        found: String,
        expected: u32,
    },

    #[error("Catalog writer is closed")]
    WriterClosed,

    #[error("Invalid record field: {0}")]
    InvalidField(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, CatalogError>;
