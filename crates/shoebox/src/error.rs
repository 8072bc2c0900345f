//! Error types for the Shoebox pipeline.

use std::io;
use thiserror::Error;

/// Shoebox error type
#[derive(Error, Debug)]
pub enum ShoeboxError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Catalog error: {0}")]
    Catalog(#[from] shoebox_catalog::CatalogError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Pattern error: {0}")]
    Pattern(String),

    #[error("Probe error: {0}")]
    Probe(String),

    #[error("AI classifier unavailable: {0}")]
    AiUnavailable(String),

    #[error("Invariant violation: {0}")]
    Invariant(String),

    #[error("Plan conflict: target '{target}' contested by '{first}' and '{second}'")]
    PlanConflict {
        target: String,
        first: String,
        second: String,
    },
}

impl ShoeboxError {
    /// Process exit code for a fatal error.
    ///
    /// 1 = configuration / environment, 2 = invariant violation,
    /// 3 = AI unreachable in a mode that requires it.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::Pattern(_) => 1,
            Self::Invariant(_) | Self::PlanConflict { .. } => 2,
            Self::AiUnavailable(_) => 3,
            _ => 1,
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, ShoeboxError>;
