//! Shoebox - reorganization planning for disorganized file collections
//!
//! Shoebox walks source trees accumulated over years of backups, computes
//! content and folder fingerprints for duplicate detection, classifies
//! files and folders through an ordered rules engine with an AI fallback,
//! and emits a deterministic, non-destructive reorganization plan.
//!
//! # Pipeline
//!
//! ```text
//! ┌─────────┐   ┌────────┐   ┌────────────────┐   ┌─────────┐
//! │ Scanner │──▶│ Hasher │──▶│ Classifier     │──▶│ Planner │
//! │         │   │        │   │ Rules→AI→Deflt │   │         │
//! └────┬────┘   └───┬────┘   └───────┬────────┘   └────┬────┘
//!      └────────────┴────────────────┴─────────────────┘
//!                     shared SQLite catalog
//! ```
//!
//! Sources are never mutated; the only outputs are the catalog database
//! and the plan.

pub mod ai;
pub mod cancel;
pub mod categories;
pub mod classify;
pub mod cli;
pub mod config;
pub mod error;
pub mod hasher;
pub mod orchestrator;
pub mod planner;
pub mod probe;
pub mod rules;
pub mod scanner;

pub use cancel::CancellationToken;
pub use config::{AppConfig, ClassifierKind, Mode};
pub use error::{Result, ShoeboxError};
pub use orchestrator::Orchestrator;
